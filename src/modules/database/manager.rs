use crate::modules::database::MODELS;
use crate::modules::error::{code::ErrorCode, RelayMailError, RelayMailResult};
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;
use native_db::{Builder, Database};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const QUEUE_FILE: &str = "queue.db";

/// Open the queue database according to the process settings: the on-disk
/// file under the data directory, or an in-memory instance when memory mode
/// is enabled (state is lost on restart).
pub fn open_database() -> RelayMailResult<Arc<Database<'static>>> {
    if SETTINGS.relaymail_metadata_memory_mode_enabled {
        return open_in_memory();
    }
    std::fs::create_dir_all(&SETTINGS.relaymail_data_dir)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    open_at(&SETTINGS.relaymail_data_dir.join(QUEUE_FILE))
}

pub fn open_in_memory() -> RelayMailResult<Arc<Database<'static>>> {
    Ok(Arc::new(
        Builder::new()
            .create_in_memory(&MODELS)
            .map_err(handle_database_error)?,
    ))
}

pub fn open_at(path: &Path) -> RelayMailResult<Arc<Database<'static>>> {
    info!("Opening queue database at: {:?}", path);
    let mut database = Builder::new()
        .set_cache_size(
            SETTINGS
                .relaymail_metadata_cache_size
                .unwrap_or(134217728)
                .max(67108864),
        ) //default 128MB
        .create(&MODELS, path)
        .map_err(handle_database_error)?;
    database
        .compact()
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    Ok(Arc::new(database))
}

fn handle_database_error(error: native_db::db_type::Error) -> RelayMailError {
    match error {
        native_db::db_type::Error::RedbDatabaseError(database_error) => match database_error {
            redb::DatabaseError::DatabaseAlreadyOpen => {
                raise_error!(
                    "Database is already open by another instance".into(),
                    ErrorCode::InternalError
                )
            }
            other => {
                raise_error!(
                    format!("Database error: {:?}", other),
                    ErrorCode::InternalError
                )
            }
        },
        other => {
            raise_error!(
                format!("Failed to create database: {:?}", other),
                ErrorCode::InternalError
            )
        }
    }
}
