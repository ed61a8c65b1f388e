use super::*;

#[test]
fn engine_config_defaults_are_sane() {
    let config = EngineConfig::default();
    assert_eq!(config.page_size, 4096);
    assert_eq!(config.records_per_page(), 512);
    assert_eq!(config.records_per_range(), 16 * 512);
}

#[test]
fn db_error_formats_cleanly() {
    let err = DbError::Storage("corruption".into());
    assert!(format!("{err}").contains("storage"));
}

#[test]
fn io_error_converts() {
    let e = io::Error::other("oops");
    let db_err: DbError = e.into();
    assert!(matches!(db_err, DbError::Io(_)));
}
