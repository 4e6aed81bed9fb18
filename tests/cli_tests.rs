//! CLI tests for the agentdeck binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn agentdeck(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("agentdeck");
    cmd.current_dir(dir.path())
        .env_remove("AGENTDECK_AGENT_CMD")
        .env_remove("CLAUDE_CMD")
        .env_remove("AGENTDECK_PORT")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::create_dir_all(dir.path().join(".agentdeck")).unwrap();
    fs::write(dir.path().join(".agentdeck/agentdeck.toml"), content).unwrap();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir).arg("frobnicate").assert().failure();
    }
}

mod config_command {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created agentdeck.toml"));

        let content = fs::read_to_string(dir.path().join(".agentdeck/agentdeck.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("port = 3141"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[server]\nport = 9000\n");
        agentdeck(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".agentdeck/agentdeck.toml")).unwrap();
        assert!(content.contains("9000"));
    }

    #[test]
    fn test_config_validate_without_file() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[server]\nport = 0\n\n[gateway]\nsubscriber_buffer = 0\n");
        agentdeck(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("port"));
    }

    #[test]
    fn test_config_validate_rejects_malformed_toml() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[server\nport = ");
        agentdeck(&dir).args(["config", "validate"]).assert().failure();
    }

    #[test]
    fn test_config_show_includes_env_override() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[agent]\ncommand = \"from-file\"\n");
        agentdeck(&dir)
            .args(["config", "show"])
            .env("AGENTDECK_AGENT_CMD", "from-env")
            .assert()
            .success()
            .stdout(predicate::str::contains("command = \"from-file\""))
            .stdout(predicate::str::contains("agent command = \"from-env\""));
    }

    #[test]
    fn test_config_show_with_project_dir_flag() {
        let dir = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        write_config(&project, "[server]\nport = 4555\n");
        agentdeck(&dir)
            .args(["config", "show", "--project-dir"])
            .arg(project.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("4555"));
    }
}

mod serve_command {
    use super::*;

    #[test]
    fn test_serve_init_creates_database() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir)
            .args(["serve", "--init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));
        assert!(dir.path().join(".agentdeck/agentdeck.db").exists());
    }

    #[test]
    fn test_serve_init_respects_db_path_flag() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir)
            .args(["serve", "--init", "--db-path", "data/chat.db"])
            .assert()
            .success();
        assert!(dir.path().join("data/chat.db").exists());
    }

    #[test]
    fn test_serve_rejects_bad_env_port() {
        let dir = TempDir::new().unwrap();
        agentdeck(&dir)
            .args(["serve", "--init"])
            .env("AGENTDECK_PORT", "not-a-port")
            .assert()
            .failure()
            .stderr(predicate::str::contains("AGENTDECK_PORT"));
    }
}
