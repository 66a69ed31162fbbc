use errors::ErrorMetadataAnyhowExt;

/// Log an unexpected error with its full chain. Call sites that swallow an
/// error to keep a background worker alive should route it through here so
/// it is never silently dropped.
pub fn report_error(err: &mut anyhow::Error) {
    tracing::error!("Caught error [{}]: {err:#}", err.short_msg());
}
