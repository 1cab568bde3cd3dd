mod current;
mod download;
mod extract;
mod fs_utils;
mod layout;
mod script;
mod uninstall;

pub use current::{publish_current, read_current, CurrentVersion};
pub use download::download_archive;
pub use extract::{extract_archive, extract_archive_blocking};
pub use layout::{DistLayout, CURRENT_LINK_NAME, ENV_FILE_NAME, STORAGE_DIR_NAME};
pub use script::{run_script, shell_command};
pub use uninstall::{remove_installed, safe_installed_path, RemovedPaths};
