mod archive;
mod cache;
mod error;
mod meta;
mod platform;
mod release;

pub use archive::ArchiveType;
pub use cache::{GithubRepoInfo, PackageCache};
pub use error::PkgError;
pub use meta::{
    github_split_path, validate_package_name, BuildRecipe, Distributable, Inject, PackageMeta,
    ScriptRecipe, DEFAULT_STRIP_COMPONENTS,
};
pub use platform::{host_arch, host_os};
pub use release::{parse_published_at, parse_release_version, render_url_template, ReleaseFacts};
