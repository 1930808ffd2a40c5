// Own test binary: the logger can be installed only once per process
use e4c_demo::init_logging;
use e4c_lib::{InjectorConfig, LoggingConfig};

#[test]
fn test_logging_section_writes_to_file() {
    let file = std::env::temp_dir().join(format!("e4c_demo_{}.log", std::process::id()));
    let _ = std::fs::remove_file(&file);

    let config = InjectorConfig {
        logging: Some(LoggingConfig {
            file: file.to_string_lossy().into_owned(),
            level: "debug".to_string(),
            ..LoggingConfig::default()
        }),
        ..InjectorConfig::default()
    };
    init_logging(&config).unwrap();
    log::debug!("logging section applied");

    let content = std::fs::read_to_string(&file).unwrap();
    assert!(content.contains("logging section applied"));
    std::fs::remove_file(&file).unwrap();
}
