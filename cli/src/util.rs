use futures::StreamExt;
use serde_json::{Value, json};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CLIENT_ERROR: i32 = 1;
pub const EXIT_SERVER_ERROR: i32 = 2;
pub const EXIT_CONNECTION_ERROR: i32 = 3;
pub const EXIT_USAGE_ERROR: i32 = 4;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.unwrap_or_else(|_| value.to_string())
}

/// Print a structured usage error and exit with code 4.
pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", render(&err, true));
    std::process::exit(EXIT_USAGE_ERROR);
}

pub fn require_user_id(user_id: Option<&str>) -> &str {
    user_id.unwrap_or_else(|| {
        exit_error(
            "user_id is required for this command",
            Some("Set --user-id or LIFTLOG_USER_ID env var"),
        )
    })
}

pub fn exit_code_for_status(status: u16) -> i32 {
    match status {
        200..=299 => EXIT_OK,
        400..=499 => EXIT_CLIENT_ERROR,
        _ => EXIT_SERVER_ERROR,
    }
}

fn build_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    user_id: Option<&str>,
    body: Option<Value>,
    query: &[(String, String)],
) -> Result<reqwest::RequestBuilder, i32> {
    let url = match reqwest::Url::parse(&format!("{api_url}{path}")) {
        Ok(mut u) => {
            if !query.is_empty() {
                let mut q = u.query_pairs_mut();
                for (k, v) in query {
                    q.append_pair(k, v);
                }
            }
            u
        }
        Err(e) => {
            let err = json!({
                "error": "cli_error",
                "message": format!("Invalid URL: {api_url}{path}: {e}")
            });
            eprintln!("{}", render(&err, true));
            return Err(EXIT_USAGE_ERROR);
        }
    };

    let mut req = client().request(method, url);
    if let Some(id) = user_id {
        req = req.header("x-user-id", id);
    }
    if let Some(b) = body {
        req = req.json(&b);
    }
    Ok(req)
}

fn connection_error(e: &reqwest::Error) -> i32 {
    let err = json!({
        "error": "connection_error",
        "message": format!("{e}"),
        "docs_hint": "Is the API server running? Check LIFTLOG_API_URL."
    });
    eprintln!("{}", render(&err, true));
    EXIT_CONNECTION_ERROR
}

/// Execute an API request, print the JSON response, return the exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    user_id: Option<&str>,
    body: Option<Value>,
    query: &[(String, String)],
) -> i32 {
    let req = match build_request(api_url, method, path, user_id, body, query) {
        Ok(req) => req,
        Err(code) => return code,
    };

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => return connection_error(&e),
    };

    let status = resp.status().as_u16();
    let exit_code = exit_code_for_status(status);

    let resp_body: Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    let formatted = render(&resp_body, true);
    if exit_code == EXIT_OK {
        println!("{formatted}");
    } else {
        eprintln!("{formatted}");
    }
    exit_code
}

/// POST and relay a server-sent event stream, one JSON payload per line.
///
/// The exit code follows the HTTP status, except that a terminal `error`
/// event turns a 200 stream into a server error.
pub async fn api_stream(api_url: &str, path: &str, user_id: Option<&str>, body: Value) -> i32 {
    let req = match build_request(api_url, reqwest::Method::POST, path, user_id, Some(body), &[]) {
        Ok(req) => req,
        Err(code) => return code,
    };

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => return connection_error(&e),
    };

    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let resp_body: Value = resp
            .json()
            .await
            .unwrap_or_else(|_| json!({"error": "non-json response"}));
        eprintln!("{}", render(&resp_body, true));
        return exit_code_for_status(status);
    }

    let mut exit_code = EXIT_OK;
    let mut buffer = String::new();
    let mut chunks = resp.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return connection_error(&e),
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            if let Some(payload) = sse_data(&frame) {
                if payload.get("type").and_then(Value::as_str) == Some("error") {
                    exit_code = EXIT_SERVER_ERROR;
                }
                println!("{}", render(&payload, false));
            }
        }
    }
    exit_code
}

/// Decode the `data:` lines of one SSE frame. Keep-alive comments yield `None`.
fn sse_data(frame: &str) -> Option<Value> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect();
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data.join("\n")).ok()
}

/// Read JSON from a file path or stdin (when path is "-").
pub fn read_json_from_file(path: &str) -> Result<Value, String> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin())
            .map_err(|e| format!("Failed to read stdin: {e}"))?
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))?
    };
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in '{path}': {e}"))
}
