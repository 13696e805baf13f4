//! Credential file loading and redaction.

use std::collections::BTreeMap;

use filemailer::config::{SmtpConfig, TelegramConfig};
use filemailer::credentials::{
    enforce_private_file_permissions, load_credentials, write_env_template, Credentials,
    ENV_TEMPLATE,
};

#[test]
fn debug_output_is_redacted() {
    let mut vars = BTreeMap::new();
    vars.insert(
        "FILEMAILER_SMTP_PASSWORD".to_owned(),
        "hunter2-secret".to_owned(),
    );
    let creds = Credentials::from_map(vars);

    let debug = format!("{creds:?}");
    assert!(debug.contains("FILEMAILER_SMTP_PASSWORD"));
    assert!(!debug.contains("hunter2-secret"));
}

#[test]
fn blank_values_count_as_missing() {
    let mut vars = BTreeMap::new();
    vars.insert("EMPTY".to_owned(), "   ".to_owned());
    vars.insert("SET".to_owned(), "value".to_owned());
    let creds = Credentials::from_map(vars);

    assert_eq!(creds.get("SET"), Some("value"));
    assert_eq!(creds.get("EMPTY"), None);
    assert!(creds.require("EMPTY").is_err());
    assert!(creds.require("ABSENT").is_err());
}

#[test]
fn missing_file_points_at_init() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let err = load_credentials(&tmp.path().join(".env")).expect_err("no file");
    assert!(err.to_string().contains("filemailer init"), "{err}");
}

fn creds(pairs: &[(&str, &str)]) -> Credentials {
    Credentials::from_map(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect(),
    )
}

#[test]
fn bot_token_follows_configured_key() {
    let telegram = TelegramConfig {
        bot_token_env: "MY_BOT".to_owned(),
        admin_chat_id: -1,
    };
    let found = creds(&[("MY_BOT", "123:abc")]);
    assert_eq!(found.bot_token(&telegram).expect("set"), "123:abc");

    let blank = creds(&[("MY_BOT", ""), ("FILEMAILER_TELEGRAM_TOKEN", "other")]);
    let err = blank.bot_token(&telegram).expect_err("blank token");
    assert!(format!("{err:#}").contains("MY_BOT"));
}

#[test]
fn smtp_password_only_needed_with_username() {
    let anonymous = SmtpConfig::default();
    assert_eq!(creds(&[]).smtp_password(&anonymous).expect("no auth"), None);

    let authenticated = SmtpConfig {
        username: Some("bot".to_owned()),
        ..SmtpConfig::default()
    };
    let err = creds(&[])
        .smtp_password(&authenticated)
        .expect_err("username without password");
    assert!(format!("{err:#}").contains("FILEMAILER_SMTP_PASSWORD"));

    let password = creds(&[("FILEMAILER_SMTP_PASSWORD", "pw")])
        .smtp_password(&authenticated)
        .expect("password set");
    assert_eq!(password.as_deref(), Some("pw"));
}

#[cfg(unix)]
#[test]
fn env_template_is_private_and_never_overwritten() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join(".env");

    assert!(write_env_template(&path).expect("first write"));
    assert_eq!(std::fs::read_to_string(&path).expect("read"), ENV_TEMPLATE);
    let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    // The template itself loads, with every secret unset.
    let loaded = load_credentials(&path).expect("template loads");
    assert_eq!(loaded.get("FILEMAILER_TELEGRAM_TOKEN"), None);

    std::fs::write(&path, "FILEMAILER_SMTP_PASSWORD=kept\n").expect("edit");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).expect("chmod");
    assert!(!write_env_template(&path).expect("second call"));
    assert_eq!(
        std::fs::read_to_string(&path).expect("read"),
        "FILEMAILER_SMTP_PASSWORD=kept\n"
    );
    let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[cfg(unix)]
#[test]
fn loads_private_file() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join(".env");
    std::fs::write(
        &path,
        "FILEMAILER_TELEGRAM_TOKEN=123:abc\nFILEMAILER_SMTP_PASSWORD=pw\n",
    )
    .expect("write env");
    enforce_private_file_permissions(&path).expect("chmod");

    let creds = load_credentials(&path).expect("credentials load");
    assert_eq!(creds.get("FILEMAILER_TELEGRAM_TOKEN"), Some("123:abc"));
    assert_eq!(
        creds.require("FILEMAILER_SMTP_PASSWORD").expect("present"),
        "pw"
    );
}

#[cfg(unix)]
#[test]
fn rejects_world_readable_file() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join(".env");
    std::fs::write(&path, "FILEMAILER_SMTP_PASSWORD=pw\n").expect("write env");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).expect("chmod");

    let err = load_credentials(&path).expect_err("0644 is too broad");
    assert!(err.to_string().contains("0600"));
}
