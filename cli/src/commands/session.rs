use clap::Subcommand;
use uuid::Uuid;

use crate::util::{api_request, exit_error, read_json_from_file};

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Open a new workout session
    Start,
    /// Add one exercise record to an open session
    AddExercise {
        /// Session ID
        session_id: Uuid,
        /// JSON file with the exercise record (use '-' for stdin)
        #[arg(long, short = 'f')]
        file: String,
    },
    /// Close a session and finalize its total volume
    End {
        /// Session ID
        session_id: Uuid,
    },
    /// Show a session with its exercises and muscle activations
    Show {
        /// Session ID
        session_id: Uuid,
    },
}

pub async fn run(api_url: &str, user_id: &str, command: SessionCommands) -> i32 {
    match command {
        SessionCommands::Start => {
            api_request(
                api_url,
                reqwest::Method::POST,
                "/v1/sessions",
                Some(user_id),
                None,
                &[],
            )
            .await
        }
        SessionCommands::AddExercise { session_id, file } => {
            let record = match read_json_from_file(&file) {
                Ok(v) => v,
                Err(e) => exit_error(
                    &e,
                    Some("Provide an exercise record as JSON, e.g. {\"name\":\"bench press\",\"sets\":3,\"reps\":[10,10,10],\"weight\":[135,135,135],\"muscle_activations\":[...]}"),
                ),
            };
            api_request(
                api_url,
                reqwest::Method::POST,
                &format!("/v1/sessions/{session_id}/exercises"),
                Some(user_id),
                Some(record),
                &[],
            )
            .await
        }
        SessionCommands::End { session_id } => {
            api_request(
                api_url,
                reqwest::Method::POST,
                &format!("/v1/sessions/{session_id}/end"),
                Some(user_id),
                None,
                &[],
            )
            .await
        }
        SessionCommands::Show { session_id } => {
            api_request(
                api_url,
                reqwest::Method::GET,
                &format!("/v1/sessions/{session_id}"),
                Some(user_id),
                None,
                &[],
            )
            .await
        }
    }
}
