mod host;
mod paths;

pub use host::HostPlatform;
pub use paths::{AppPaths, AppPathsError, HOME_OVERRIDE_VAR};
