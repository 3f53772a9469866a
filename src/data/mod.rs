mod identity;
mod log_tree;
mod path;
mod storage_utils;
mod thread;

pub use identity::{
    group_of, region_name, CallSite, Frame, FrameToken, RegionIdentity, NO_FILE,
    UNKNOWN_MODULE, USER_MODULE,
};
pub use log_tree::LogTree;
pub use path::{abspath, normalize};
pub(crate) use storage_utils::{with_span_storage_mut, with_span_storage_or_default};
pub use thread::thread_index;
