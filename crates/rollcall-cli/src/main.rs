use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `AttendanceProxy` for the async client.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, identity_id: &str, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn reenroll(&self, identity_id: &str, image_path: &str, replace: bool) -> zbus::Result<String>;
    async fn remove_identity(&self, identity_id: &str) -> zbus::Result<String>;
    async fn rename_identity(&self, identity_id: &str, name: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn recognize(&self, image_path: &str) -> zbus::Result<String>;
    async fn reconcile(&self, date: &str, submissions_json: &str) -> zbus::Result<String>;
    async fn check_out(&self, identity_id: &str, date: &str, time: &str) -> zbus::Result<String>;
    async fn day(&self, date: &str) -> zbus::Result<String>;
    async fn history(&self, identity_id: &str, from: &str, to: &str) -> zbus::Result<String>;
    async fn report(&self, date: &str) -> zbus::Result<String>;
    async fn remove_record(&self, identity_id: &str, date: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a photo containing exactly one face
    Enroll {
        /// Stable identifier, e.g. a student or employee number
        id: String,
        /// Display name
        name: String,
        image: PathBuf,
    },
    /// Add another reference photo to an enrolled identity
    Reenroll {
        id: String,
        image: PathBuf,
        /// Discard existing references
        #[arg(long)]
        replace: bool,
    },
    /// Remove an identity and its attendance history
    Remove { id: String },
    /// Change an identity's display name
    Rename { id: String, name: String },
    /// List enrolled identities
    List,
    /// Recognize faces in a photo and check them in
    Recognize { image: PathBuf },
    /// Submit a roster for one day
    Mark {
        /// Day to mark (YYYY-MM-DD); defaults to today
        #[arg(short, long, default_value = "")]
        date: String,
        /// ID=STATUS[@HH:MM[:SS]], repeatable
        #[arg(short, long = "entry", required = true)]
        entries: Vec<String>,
        /// Note attached to every entry in this submission
        #[arg(long)]
        note: Option<String>,
    },
    /// Record a check-out time
    Checkout {
        id: String,
        #[arg(short, long, default_value = "")]
        date: String,
        /// HH:MM[:SS]; defaults to now
        #[arg(short, long, default_value = "")]
        time: String,
    },
    /// Show every record for one day
    Day {
        #[arg(default_value = "")]
        date: String,
    },
    /// Show one identity's records between two dates
    History {
        id: String,
        from: String,
        #[arg(default_value = "")]
        to: String,
    },
    /// Day summary and per-identity attendance rates
    Report {
        #[arg(default_value = "")]
        date: String,
    },
    /// Delete a single attendance record
    Unmark { id: String, date: String },
    /// Show daemon status
    Status,
}

/// Parse `ID=STATUS[@TIME]` into a submission object.
fn parse_entry(entry: &str, note: Option<&str>) -> Result<serde_json::Value> {
    let Some((id, rest)) = entry.split_once('=') else {
        bail!("entry {entry:?} must look like ID=STATUS[@HH:MM]");
    };
    let id = id.trim();
    if id.is_empty() {
        bail!("entry {entry:?} has an empty identity");
    }
    let (status, check_in) = match rest.split_once('@') {
        Some((status, time)) => (status.trim(), Some(time.trim())),
        None => (rest.trim(), None),
    };
    if status.is_empty() {
        bail!("entry {entry:?} has an empty status");
    }

    let mut submission = serde_json::json!({
        "identity_id": id,
        "status": status,
    });
    if let Some(time) = check_in {
        submission["check_in"] = time.into();
    }
    if let Some(note) = note {
        submission["note"] = note.into();
    }
    Ok(submission)
}

/// The daemon resolves paths itself, so relative paths are anchored here.
fn absolute(path: &Path) -> Result<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot determine the working directory")?
            .join(path)
    };
    Ok(path.to_string_lossy().into_owned())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match cli.command {
        Commands::Enroll { id, name, image } => proxy.enroll(&id, &name, &absolute(&image)?).await?,
        Commands::Reenroll { id, image, replace } => {
            proxy.reenroll(&id, &absolute(&image)?, replace).await?
        }
        Commands::Remove { id } => proxy.remove_identity(&id).await?,
        Commands::Rename { id, name } => proxy.rename_identity(&id, &name).await?,
        Commands::List => proxy.list_identities().await?,
        Commands::Recognize { image } => proxy.recognize(&absolute(&image)?).await?,
        Commands::Mark {
            date,
            entries,
            note,
        } => {
            let submissions = entries
                .iter()
                .map(|e| parse_entry(e, note.as_deref()))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(count = submissions.len(), "submitting roster");
            let json = serde_json::to_string(&submissions)?;
            proxy.reconcile(&date, &json).await?
        }
        Commands::Checkout { id, date, time } => proxy.check_out(&id, &date, &time).await?,
        Commands::Day { date } => proxy.day(&date).await?,
        Commands::History { id, from, to } => proxy.history(&id, &from, &to).await?,
        Commands::Report { date } => proxy.report(&date).await?,
        Commands::Unmark { id, date } => {
            proxy.remove_record(&id, &date).await?;
            println!("removed {id} on {date}");
            return Ok(());
        }
        Commands::Status => proxy.status().await?,
    };

    print_json(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_with_time() {
        let s = parse_entry("S001=late@10:15", None).unwrap();
        assert_eq!(s["identity_id"], "S001");
        assert_eq!(s["status"], "late");
        assert_eq!(s["check_in"], "10:15");
        assert!(s.get("note").is_none());
    }

    #[test]
    fn test_parse_entry_plain_with_note() {
        let s = parse_entry("S002=Absent", Some("sick")).unwrap();
        assert_eq!(s["status"], "Absent");
        assert!(s.get("check_in").is_none());
        assert_eq!(s["note"], "sick");
    }

    #[test]
    fn test_parse_entry_rejects_malformed() {
        assert!(parse_entry("S001", None).is_err());
        assert!(parse_entry("=present", None).is_err());
        assert!(parse_entry("S001=", None).is_err());
    }

    #[test]
    fn test_cli_parses_rename() {
        let cli = Cli::try_parse_from(["rollcall", "rename", "S001", "Alicia Smith"]).unwrap();
        match cli.command {
            Commands::Rename { id, name } => {
                assert_eq!(id, "S001");
                assert_eq!(name, "Alicia Smith");
            }
            _ => panic!("expected rename"),
        }
    }

    #[test]
    fn test_cli_parses_repeated_entries() {
        let cli = Cli::try_parse_from([
            "rollcall", "mark", "-d", "2024-01-10", "-e", "S001=present", "-e", "S002=absent",
        ])
        .unwrap();
        match cli.command {
            Commands::Mark { date, entries, note } => {
                assert_eq!(date, "2024-01-10");
                assert_eq!(entries.len(), 2);
                assert!(note.is_none());
            }
            _ => panic!("expected mark"),
        }
    }
}
