use serde_json::json;

use crate::util::{api_request, api_stream};

pub async fn log(
    api_url: &str,
    user_id: &str,
    text: &str,
    session_id: Option<&str>,
    agent_session_id: Option<&str>,
    stream: bool,
) -> i32 {
    let mut body = json!({ "text": text });
    if let Some(id) = session_id {
        body["session_id"] = json!(id);
    }
    if let Some(id) = agent_session_id {
        body["agent_session_id"] = json!(id);
    }

    if stream {
        api_stream(api_url, "/v1/workouts/log/stream", Some(user_id), body).await
    } else {
        api_request(
            api_url,
            reqwest::Method::POST,
            "/v1/workouts/log",
            Some(user_id),
            Some(body),
            &[],
        )
        .await
    }
}
