pub const TOPIC_PREFIX: &str = "frog";
pub const TOPIC_PREFIX_FILTER: &str = "frog/#";
pub const TOPIC_BEDROOM_DELAY: &str = "frog/Bedroom_delay";
pub const TOPIC_SITTINGROOM_DELAY: &str = "frog/Sr_delay";

pub const TOPIC_PLUG_STATUS: &str = "meross/plugs/status";

pub const TOPIC_APPLIANCE_PREFIX: &str = "/appliance/";
pub const TOPIC_APPLIANCE_FILTER: &str = "/appliance/#";
