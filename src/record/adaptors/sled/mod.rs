mod sled_record_store;


use std::path::Path;

pub use sled_record_store::*;
use tracing::debug;
use tracing::warn;

/// Opens the embedded record database under the given root path
pub fn init_record_db(
    db_root_path: impl AsRef<Path> + std::fmt::Debug,
    cache_capacity_bytes: u64,
) -> std::result::Result<sled::Db, std::io::Error> {
    debug!("init_record_db from path: {:?}", &db_root_path);

    sled::Config::default()
        .path(db_root_path.as_ref())
        .cache_capacity(cache_capacity_bytes)
        .use_compression(true)
        .compression_factor(1)
        .open()
        .map_err(|e| {
            warn!(
                "Try to open DB at this location: {:?} and failed: {:?}",
                db_root_path, e
            );
            std::io::Error::other(e)
        })
}
