use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::analytics::AnalyticsCommands;
use commands::session::SessionCommands;
use util::{EXIT_USAGE_ERROR, require_user_id};

#[derive(Parser)]
#[command(name = "liftlog", version, about = "Liftlog CLI: log workouts in plain words and read per-muscle training volume")]
struct Cli {
    /// API base URL
    #[arg(long, env = "LIFTLOG_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// User ID sent as x-user-id
    #[arg(long, env = "LIFTLOG_USER_ID")]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Describe a workout in plain words and store what the agent extracts
    Log {
        /// Workout description, e.g. "3 sets of 10 at 135 lbs bench press"
        text: String,
        /// Add the exercises to this open session instead of a new one
        #[arg(long)]
        session_id: Option<uuid::Uuid>,
        /// Agent conversation to continue
        #[arg(long)]
        agent_session_id: Option<String>,
        /// Print pipeline events as they arrive
        #[arg(long)]
        stream: bool,
    },
    /// Workout session operations
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Muscle volume analytics
    Analytics {
        #[command(subcommand)]
        command: AnalyticsCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_USAGE_ERROR } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let user_id = cli.user_id.as_deref();
    let code = match cli.command {
        Commands::Health => commands::health::run(&cli.api_url).await,
        Commands::Log {
            text,
            session_id,
            agent_session_id,
            stream,
        } => {
            let session_id = session_id.map(|id| id.to_string());
            commands::workout::log(
                &cli.api_url,
                require_user_id(user_id),
                &text,
                session_id.as_deref(),
                agent_session_id.as_deref(),
                stream,
            )
            .await
        }
        Commands::Session { command } => {
            commands::session::run(&cli.api_url, require_user_id(user_id), command).await
        }
        Commands::Analytics { command } => {
            commands::analytics::run(&cli.api_url, require_user_id(user_id), command).await
        }
    };

    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_session_add_exercise() {
        let cli = Cli::try_parse_from([
            "liftlog",
            "--user-id",
            "u1",
            "session",
            "add-exercise",
            "0190b2a4-0000-7000-8000-000000000000",
            "--file",
            "bench.json",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Session {
                command: SessionCommands::AddExercise { .. }
            }
        ));
    }

    #[test]
    fn rejects_malformed_session_id() {
        assert!(Cli::try_parse_from(["liftlog", "session", "end", "not-a-uuid"]).is_err());
    }
}
