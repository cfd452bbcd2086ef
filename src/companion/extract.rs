//! Field extraction from loosely typed companion payloads. Each field has an
//! ordered list of strategies; the first one that yields a value wins.

use serde_json::Value;

type Strategy = fn(&Value) -> Option<String>;

fn first_match(value: &Value, strategies: &[Strategy]) -> Option<String> {
    strategies.iter().find_map(|strategy| strategy(value))
}

fn text_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    match current {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

const THREAD_ID: &[Strategy] = &[
    |value| text_at(value, &["threadId"]),
    |value| text_at(value, &["thread_id"]),
    |value| text_at(value, &["thread", "id"]),
    |value| text_at(value, &["turn", "threadId"]),
    |value| text_at(value, &["conversationId"]),
    |value| text_at(value, &["msg", "thread_id"]),
];

const TURN_ID: &[Strategy] = &[
    |value| text_at(value, &["turnId"]),
    |value| text_at(value, &["turn_id"]),
    |value| text_at(value, &["turn", "id"]),
    |value| text_at(value, &["msg", "turn_id"]),
];

const DELTA_TEXT: &[Strategy] = &[
    |value| text_at(value, &["delta"]),
    |value| text_at(value, &["delta", "text"]),
    |value| text_at(value, &["msg", "delta"]),
    |value| text_at(value, &["text"]),
    content_parts,
];

const TURN_STATUS: &[Strategy] = &[
    |value| text_at(value, &["turn", "status"]),
    |value| text_at(value, &["status"]),
    |value| text_at(value, &["msg", "status"]),
    |value| {
        value
            .get("turn")
            .and_then(|turn| turn.get("error"))
            .filter(|error| !error.is_null())
            .map(|_| "failed".to_string())
    },
];

const ERROR_MESSAGE: &[Strategy] = &[
    |value| text_at(value, &["error", "message"]),
    |value| text_at(value, &["error"]),
    |value| text_at(value, &["message"]),
    |value| text_at(value, &["turn", "error", "message"]),
];

fn content_parts(value: &Value) -> Option<String> {
    let parts = value.get("content")?.as_array()?;
    let joined = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<String>();
    (!joined.is_empty()).then_some(joined)
}

pub fn thread_id(value: &Value) -> Option<String> {
    first_match(value, THREAD_ID)
}

pub fn turn_id(value: &Value) -> Option<String> {
    first_match(value, TURN_ID)
}

pub fn delta_text(value: &Value) -> Option<String> {
    first_match(value, DELTA_TEXT)
}

pub fn turn_status(value: &Value) -> Option<String> {
    first_match(value, TURN_STATUS)
}

pub fn error_message(value: &Value) -> Option<String> {
    first_match(value, ERROR_MESSAGE)
}
