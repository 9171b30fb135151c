use clap::Subcommand;

use crate::util::api_request;

#[derive(Subcommand)]
pub enum AnalyticsCommands {
    /// Daily volume per muscle
    Volume {
        /// "weekly", "monthly" or a day count
        #[arg(long, default_value = "weekly")]
        window: String,
    },
    /// Per-muscle totals with training status
    Tracking {
        /// Lookback in days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Daily volume series per muscle
    Progression {
        /// "weekly", "monthly" or a day count
        #[arg(long, default_value = "monthly")]
        window: String,
    },
    /// Completed session frequency
    Frequency {
        /// Lookback in days
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

pub async fn run(api_url: &str, user_id: &str, command: AnalyticsCommands) -> i32 {
    let (path, query) = match command {
        AnalyticsCommands::Volume { window } => {
            ("/v1/analytics/muscle-volume", ("window", window))
        }
        AnalyticsCommands::Tracking { days } => {
            ("/v1/analytics/muscle-tracking", ("days", days.to_string()))
        }
        AnalyticsCommands::Progression { window } => {
            ("/v1/analytics/volume-progression", ("window", window))
        }
        AnalyticsCommands::Frequency { days } => {
            ("/v1/analytics/frequency", ("days", days.to_string()))
        }
    };

    api_request(
        api_url,
        reqwest::Method::GET,
        path,
        Some(user_id),
        None,
        &[(query.0.to_string(), query.1)],
    )
    .await
}
