#![allow(clippy::unwrap_used, clippy::expect_used)]

use switchyard_core::*;

// ---------------------------------------------------------------------------
// 1. `?` propagation through the shared result alias
// ---------------------------------------------------------------------------

fn parse_payload(raw: &str) -> SwitchyardResult<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(SwitchyardError::Transport("payload must be an object".into()));
    }
    Ok(value)
}

#[test]
fn result_alias_propagates_json_errors() {
    assert!(parse_payload(r#"{"ok": true}"#).is_ok());
    assert!(matches!(
        parse_payload("nope"),
        Err(SwitchyardError::Json(_))
    ));
    assert!(matches!(
        parse_payload("[1, 2]"),
        Err(SwitchyardError::Transport(_))
    ));
}

// ---------------------------------------------------------------------------
// 2. IO errors convert through `From`
// ---------------------------------------------------------------------------

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: SwitchyardError = io.into();
    assert!(err.to_string().contains("missing"));
}
