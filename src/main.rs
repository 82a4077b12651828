use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use url::Url;

use paysync::config::Config;
use paysync::logging;
use paysync::model::{CacheSnapshot, NavigationTarget, RecordKind, RefreshMode, Scope};
use paysync::remote::Credentials;
use paysync::service::SyncService;
use paysync::sync::RefreshOutcome;

#[derive(Parser, Debug)]
#[command(name = "paysync")]
#[command(about = "Sync and inspect the local cache of a payments account")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/paysync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for log files (default: platform data directory)
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pull the newest records from the server
  Sync {
    #[arg(long, value_enum, default_value_t = ScopeArg::All)]
    scope: ScopeArg,

    /// Walk every page instead of only the newest
    #[arg(long)]
    full: bool,
  },
  /// Print the cached snapshot
  Show,
  /// Resolve a record reference to its destination
  Resolve {
    #[arg(value_enum)]
    kind: KindArg,
    id: String,
  },
  /// Resolve a receipt link
  Open { uri: Url },
  /// Mark a notification as read
  Read { id: String },
  /// Clear the session and the cached records of the account
  Logout,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
  Transactions,
  Notifications,
  All,
}

impl ScopeArg {
  fn scopes(self) -> &'static [Scope] {
    match self {
      ScopeArg::Transactions => &[Scope::Transactions],
      ScopeArg::Notifications => &[Scope::Notifications],
      ScopeArg::All => &Scope::ALL,
    }
  }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
  Transaction,
  Notification,
}

impl From<KindArg> for RecordKind {
  fn from(kind: KindArg) -> Self {
    match kind {
      KindArg::Transaction => RecordKind::Transaction,
      KindArg::Notification => RecordKind::Notification,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_dir = args
    .log_dir
    .or_else(logging::default_log_dir)
    .ok_or_else(|| eyre!("Could not determine a log directory; pass --log-dir"))?;
  let _guard = logging::init(&log_dir)?;

  let service = SyncService::from_config(&config)?;
  let credentials = Credentials::new(config.server.username.clone(), Config::get_password()?);
  service.login(&credentials).await?;

  match args.command {
    Command::Sync { scope, full } => {
      let mode = if full {
        RefreshMode::Full
      } else {
        RefreshMode::Incremental
      };
      let outcomes =
        futures::future::join_all(scope.scopes().iter().map(|s| service.refresh(*s, mode))).await;
      let mut failed = false;
      for (scope, outcome) in scope.scopes().iter().zip(outcomes) {
        failed |= report(*scope, &outcome);
      }
      if failed {
        return Err(eyre!("Sync did not complete"));
      }
    }
    Command::Show => print_snapshot(&service.snapshot()?),
    Command::Resolve { kind, id } => {
      let target = service.resolve(kind.into(), &id).await?;
      print_target(&target);
    }
    Command::Open { uri } => {
      let target = service.resolve_link(&uri).await?;
      print_target(&target);
    }
    Command::Read { id } => {
      service.mark_notification_read(&id)?;
      println!("Marked {} as read", id);
    }
    Command::Logout => {
      service.logout()?;
      println!("Logged out");
    }
  }

  Ok(())
}

/// Print one refresh result. Returns true when it failed.
fn report(scope: Scope, outcome: &RefreshOutcome) -> bool {
  match outcome {
    Ok(snapshot) => {
      let count = match scope {
        Scope::Transactions => snapshot.transactions.len(),
        Scope::Notifications => snapshot.notifications.len(),
      };
      println!("{}: {} cached", scope, count);
      false
    }
    Err(failure) => {
      let hint = if failure.requires_reauth() {
        " (sign in again)"
      } else {
        ""
      };
      eprintln!("{}: {}{}", scope, failure, hint);
      true
    }
  }
}

fn print_snapshot(snapshot: &CacheSnapshot) {
  match snapshot.last_synced_at {
    Some(at) => println!("Last synced: {}", at.to_rfc3339()),
    None => println!("Never synced"),
  }

  println!("\nTransactions ({})", snapshot.transactions.len());
  for tx in &snapshot.transactions {
    println!(
      "  {}  {:<12} {:>12.2} {}  {:?}  {}",
      tx.timestamp.format("%Y-%m-%d %H:%M"),
      tx.id,
      tx.amount,
      tx.currency,
      tx.status,
      tx.counterparty_ref
    );
  }

  println!(
    "\nNotifications ({}, {} unread)",
    snapshot.notifications.len(),
    snapshot.unread_count()
  );
  for note in &snapshot.notifications {
    let marker = if note.read { " " } else { "*" };
    println!(
      "{} {}  {:<12} {}",
      marker,
      note.timestamp.format("%Y-%m-%d %H:%M"),
      note.id,
      note.title
    );
  }
}

fn print_target(target: &NavigationTarget) {
  match target {
    NavigationTarget::Receipt {
      transaction_id,
      uri,
      amount,
      currency,
      status,
    } => {
      println!("Receipt for {}", transaction_id);
      println!("  {:.2} {} ({:?})", amount, currency, status);
      println!("  {}", uri);
    }
    NavigationTarget::Notification {
      notification_id,
      title,
      timestamp,
    } => {
      println!("Notification {}", notification_id);
      println!("  {}", title);
      println!("  {}", timestamp.to_rfc3339());
    }
  }
}
