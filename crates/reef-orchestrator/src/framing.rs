//! Sentinel-delimited framing on the outgoing stream.
//!
//! Plain text chunks are the answer body; auxiliary events ride the same
//! stream as `__TAG__<json>__END__` so a naive concatenating reader still
//! yields a sensible answer. One encoder produces the frames and one
//! splitter consumes them; no new sentinels.

use serde::Serialize;

pub const REFERENCES_TAG: &str = "__REFERENCES__";
pub const TOOL_STATUS_TAG: &str = "__TOOL_STATUS__";
pub const GRAPH_DATA_TAG: &str = "__GRAPH_DATA__";
pub const END_TAG: &str = "__END__";

const TAGS: &[&str] = &[REFERENCES_TAG, TOOL_STATUS_TAG, GRAPH_DATA_TAG];

/// A parsed element of the outgoing stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    References(serde_json::Value),
    ToolStatus(serde_json::Value),
    GraphData(serde_json::Value),
}

pub fn encode_references(payload: &impl Serialize) -> String {
    encode(REFERENCES_TAG, payload)
}

pub fn encode_tool_status(payload: &impl Serialize) -> String {
    encode(TOOL_STATUS_TAG, payload)
}

pub fn encode_graph_data(payload: &impl Serialize) -> String {
    encode(GRAPH_DATA_TAG, payload)
}

fn encode(tag: &str, payload: &impl Serialize) -> String {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "null".to_string());
    format!("{}{}{}", tag, json, END_TAG)
}

/// Split a buffered stream into text and auxiliary frames. Unterminated or
/// unparsable frames are passed through as text so nothing is ever lost.
pub fn split_frames(input: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let next_tag = TAGS
            .iter()
            .filter_map(|tag| rest.find(tag).map(|pos| (pos, *tag)))
            .min_by_key(|(pos, _)| *pos);

        let Some((pos, tag)) = next_tag else {
            frames.push(Frame::Text(rest.to_string()));
            break;
        };

        if pos > 0 {
            frames.push(Frame::Text(rest[..pos].to_string()));
        }
        let after_tag = &rest[pos + tag.len()..];
        let Some(end) = after_tag.find(END_TAG) else {
            frames.push(Frame::Text(rest[pos..].to_string()));
            break;
        };
        let body = &after_tag[..end];
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => frames.push(match tag {
                REFERENCES_TAG => Frame::References(value),
                TOOL_STATUS_TAG => Frame::ToolStatus(value),
                _ => Frame::GraphData(value),
            }),
            Err(_) => frames.push(Frame::Text(rest[pos..pos + tag.len() + end + END_TAG.len()].to_string())),
        }
        rest = &after_tag[end + END_TAG.len()..];
    }
    frames
}

/// Concatenate only the text frames: what a naive reader sees.
pub fn answer_body(input: &str) -> String {
    split_frames(input)
        .into_iter()
        .filter_map(|f| match f {
            Frame::Text(t) => Some(t),
            _ => None,
        })
        .collect()
}
