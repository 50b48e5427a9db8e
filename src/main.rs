use std::path::PathBuf;

use anyhow::Context as _;
use certstore::{CertStore, config::Config, describe_certificate, logging};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "certstore")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Certificate directory (default `~/.cert`).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Root CA file stem (default `root`).
    #[arg(long, global = true)]
    name: Option<String>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// Manage the root CA.
    Root {
        #[command(subcommand)]
        action: RootCommand,
    },
    /// Issue (or reuse) the certificate for a hostname.
    Issue { hostname: String },
    /// Delete the root CA and every issued certificate.
    Clear,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum RootCommand {
    /// Wipe the store and generate a new root CA.
    Generate,
    /// Report whether a root CA exists.
    Status,
    /// Print the root CA certificate, or write it to `--out`.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandOutcome {
    RootGenerated {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    RootStatus {
        cert_path: PathBuf,
        common_name: Option<String>,
    },
    RootMissing {
        cert_path: PathBuf,
    },
    RootExported {
        out: Option<PathBuf>,
        pem: String,
    },
    Issued {
        hostname: String,
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    Cleared {
        dir: PathBuf,
    },
}

async fn run_command(store: &CertStore, command: Command) -> anyhow::Result<CommandOutcome> {
    match command {
        Command::Root {
            action: RootCommand::Generate,
        } => {
            store.generate_root_ca().await?;
            Ok(CommandOutcome::RootGenerated {
                cert_path: store.root_cert_path().to_path_buf(),
                key_path: store.root_key_path().to_path_buf(),
            })
        }
        Command::Root {
            action: RootCommand::Status,
        } => {
            let cert_path = store.root_cert_path().to_path_buf();
            if !store.is_root_ca_exists().await? {
                return Ok(CommandOutcome::RootMissing { cert_path });
            }
            let pem = store.root_certificate_pem().await?;
            let summary = describe_certificate(&pem)
                .with_context(|| format!("inspect root CA {}", cert_path.display()))?;
            Ok(CommandOutcome::RootStatus {
                cert_path,
                common_name: summary.subject_common_name().map(str::to_owned),
            })
        }
        Command::Root {
            action: RootCommand::Export { out },
        } => {
            let pem = store.root_certificate_pem().await?;
            if let Some(out) = out.as_ref() {
                tokio::fs::write(out, pem.as_bytes())
                    .await
                    .with_context(|| format!("write exported root CA {}", out.display()))?;
            }
            Ok(CommandOutcome::RootExported { out, pem })
        }
        Command::Issue { hostname } => {
            store.get_certificate(&hostname).await?;
            let (cert_path, key_path) = store.leaf_paths(&hostname)?;
            Ok(CommandOutcome::Issued {
                hostname,
                cert_path,
                key_path,
            })
        }
        Command::Clear => {
            store.clear_certs().await?;
            Ok(CommandOutcome::Cleared {
                dir: store.dir().to_path_buf(),
            })
        }
    }
}

fn print_command_outcome(outcome: CommandOutcome) {
    match outcome {
        CommandOutcome::RootGenerated {
            cert_path,
            key_path,
        } => {
            println!("generated root CA");
            println!("certificate: {}", cert_path.display());
            println!("private key: {}", key_path.display());
        }
        CommandOutcome::RootStatus {
            cert_path,
            common_name,
        } => {
            println!(
                "root CA present at {} (CN={})",
                cert_path.display(),
                common_name.as_deref().unwrap_or("unknown")
            );
        }
        CommandOutcome::RootMissing { cert_path } => {
            println!("no root CA at {}", cert_path.display());
        }
        CommandOutcome::RootExported { out: Some(out), .. } => {
            println!("exported root CA to {}", out.display());
        }
        CommandOutcome::RootExported { out: None, pem } => {
            print!("{pem}");
        }
        CommandOutcome::Issued {
            hostname,
            cert_path,
            key_path,
        } => {
            println!("certificate for `{hostname}`");
            println!("certificate: {}", cert_path.display());
            println!("private key: {}", key_path.display());
        }
        CommandOutcome::Cleared { dir } => {
            println!("cleared certificates in {}", dir.display());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;
    let store = CertStore::new(config.store_options(cli.dir.as_deref(), cli.name.as_deref()))?;
    let outcome = run_command(&store, cli.command).await?;
    print_command_outcome(outcome);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Cli, Command, CommandOutcome, RootCommand, run_command};
    use certstore::{CertStore, StoreOptions};
    use clap::Parser;
    use tempfile::tempdir;

    #[test]
    fn issue_parses_with_global_flags() {
        let cli = Cli::try_parse_from([
            "certstore",
            "issue",
            "example.com",
            "--dir",
            "/tmp/certs",
            "--log-level",
            "debug",
        ])
        .expect("cli parse should succeed");
        assert_eq!(cli.dir, Some(PathBuf::from("/tmp/certs")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, None);
        assert_eq!(
            cli.command,
            Command::Issue {
                hostname: "example.com".to_owned()
            }
        );
    }

    #[test]
    fn root_export_parses_out_flag() {
        let cli = Cli::try_parse_from([
            "certstore",
            "--name",
            "devca",
            "root",
            "export",
            "--out",
            "ca.pem",
        ])
        .expect("cli parse should succeed");
        assert_eq!(cli.name.as_deref(), Some("devca"));
        assert_eq!(
            cli.command,
            Command::Root {
                action: RootCommand::Export {
                    out: Some(PathBuf::from("ca.pem"))
                }
            }
        );
    }

    #[test]
    fn issue_requires_hostname() {
        assert!(Cli::try_parse_from(["certstore", "issue"]).is_err());
    }

    #[tokio::test]
    async fn generate_status_issue_clear_round_trip() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let store = CertStore::new(StoreOptions {
            dir: Some(temp_dir.path().join("certs")),
            ..StoreOptions::default()
        })
        .expect("store should construct");

        let missing = run_command(
            &store,
            Command::Root {
                action: RootCommand::Status,
            },
        )
        .await
        .expect("status should succeed");
        assert!(matches!(missing, CommandOutcome::RootMissing { .. }));

        run_command(
            &store,
            Command::Root {
                action: RootCommand::Generate,
            },
        )
        .await
        .expect("generate should succeed");

        let status = run_command(
            &store,
            Command::Root {
                action: RootCommand::Status,
            },
        )
        .await
        .expect("status should succeed");
        assert_eq!(
            status,
            CommandOutcome::RootStatus {
                cert_path: store.root_cert_path().to_path_buf(),
                common_name: Some("Sample Service".to_owned()),
            }
        );

        let issued = run_command(
            &store,
            Command::Issue {
                hostname: "example.com".to_owned(),
            },
        )
        .await
        .expect("issue should succeed");
        let CommandOutcome::Issued { cert_path, .. } = issued else {
            panic!("expected issued outcome, got {issued:?}");
        };
        assert!(cert_path.exists());

        let export_path = temp_dir.path().join("exported.pem");
        run_command(
            &store,
            Command::Root {
                action: RootCommand::Export {
                    out: Some(export_path.clone()),
                },
            },
        )
        .await
        .expect("export should succeed");
        assert_eq!(
            std::fs::read_to_string(&export_path).expect("exported file"),
            std::fs::read_to_string(store.root_cert_path()).expect("root file")
        );

        run_command(&store, Command::Clear)
            .await
            .expect("clear should succeed");
        assert!(!cert_path.exists());
        assert!(!store.is_root_ca_exists().await.expect("exists check"));
    }
}
