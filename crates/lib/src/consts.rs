//! Shared constants.

/// Application name, used for cache directory naming.
pub const APP_NAME: &str = "yb";

/// Default manifest filename at the package root.
pub const MANIFEST_FILE: &str = ".yourbase.yml";

/// Name of the implicit target synthesized from a bare `build:` block.
pub const DEFAULT_TARGET: &str = "default";

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "YB_CACHE_DIR";

/// Prefix for externally-managed container addresses:
/// `YB_CONTAINER_<LABEL>_IP`.
pub const CONTAINER_IP_ENV_PREFIX: &str = "YB_CONTAINER_";

/// Length of the package-path digest used in build-home paths.
pub const PKG_DIGEST_LEN: usize = 8;
