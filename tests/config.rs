use std::io::Write;
use tokengate::config::GatewayConfig;

#[test]
fn loads_config_from_disk() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(
        br#"{
            "listen": "127.0.0.1:9100",
            "api_keys": [{ "key": "sk-a", "user": "alice" }],
            "accounts": [{ "user": "alice", "balance": "2.50" }],
            "models": [{
                "name": "small",
                "upstream_model": "upstream-small",
                "credentials": [{ "base_url": "http://127.0.0.1:9", "api_key": "k" }]
            }]
        }"#,
    )
    .expect("write config");

    let config = GatewayConfig::load(file.path().to_str().expect("utf8 path")).expect("loads");
    assert_eq!(config.listen, "127.0.0.1:9100");
    assert_eq!(config.models[0].upstream_model, "upstream-small");
}

#[test]
fn missing_file_is_an_error() {
    let err = GatewayConfig::load("/nonexistent/tokengate.json")
        .err()
        .expect("should fail");
    assert_eq!(err.code, "config_read_failed");
}

#[test]
fn unknown_fields_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(br#"{ "listen": "127.0.0.1:9100", "surprise": true }"#)
        .expect("write config");
    let err = GatewayConfig::load(file.path().to_str().expect("utf8 path"))
        .err()
        .expect("should fail");
    assert_eq!(err.code, "config_parse_failed");
}
