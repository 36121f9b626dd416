pub fn temp_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("rmv_test")
        .tempdir()
        .expect("failed to create test directory")
}
