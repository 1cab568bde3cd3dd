mod descriptor;
mod env;
mod log_sink;
mod proxy;
mod supervisor;

pub use descriptor::{
    find_script, BackendDescriptor, BackendScript, HttpProxyConfig, BACKEND_FILE_NAME,
};
pub use env::{merge_env, parse_env_entries, read_env_file, reconcile_env_file, EnvPairs};
pub use log_sink::LogLevel;
pub use proxy::{ProxyTarget, ReverseProxy, UNIX_SOCKET_PATH_LIMIT};
pub use supervisor::{script_command, Backend, BackendStatus, STOP_POLL_INTERVAL, STOP_TIMEOUT};
