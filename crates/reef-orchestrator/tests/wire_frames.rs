// Verify the sentinel framing on the outgoing stream matches what clients
// expect. These tests ensure the wire contract is never broken.

use reef_orchestrator::framing::{
    answer_body, encode_graph_data, encode_references, encode_tool_status, split_frames, Frame,
    END_TAG, GRAPH_DATA_TAG, REFERENCES_TAG, TOOL_STATUS_TAG,
};

#[test]
fn sentinel_strings_are_fixed() {
    assert_eq!(REFERENCES_TAG, "__REFERENCES__");
    assert_eq!(TOOL_STATUS_TAG, "__TOOL_STATUS__");
    assert_eq!(GRAPH_DATA_TAG, "__GRAPH_DATA__");
    assert_eq!(END_TAG, "__END__");
}

#[test]
fn references_frame_shape() {
    let payload = serde_json::json!({
        "rich": [{
            "ref_id": "c1", "ref_marker": 1, "document_id": "a.txt",
            "chunk_id": "c1", "score": 0.9, "doc_id": "d1", "kb_id": "k1",
            "filename": "a.txt", "document_name": "a.txt",
            "content": "body", "metadata": {}
        }],
        "lean": [{
            "ref_id": "c1", "ref_marker": 1, "document_id": "a.txt",
            "chunk_id": "c1", "score": 0.9, "doc_id": "d1", "kb_id": "k1",
            "filename": "a.txt"
        }],
    });
    let frame = encode_references(&payload);
    assert!(frame.starts_with("__REFERENCES__{"));
    assert!(frame.ends_with("__END__"));

    let parsed = split_frames(&frame);
    assert_eq!(parsed.len(), 1);
    let Frame::References(value) = &parsed[0] else {
        panic!("expected a references frame");
    };
    assert_eq!(value["lean"][0]["ref_marker"], 1);
    assert_eq!(value["lean"][0]["ref_id"], "c1");
}

#[test]
fn mixed_stream_splits_into_ordered_frames() {
    let stream = format!(
        "Searching the knowledge base.{}\n\n---\n\nThe answer.{}",
        encode_tool_status(&serde_json::json!({"tool": "search_knowledge_base", "status": "success"})),
        encode_graph_data(&serde_json::json!({"nodes": [], "edges": []})),
    );
    let frames = split_frames(&stream);
    assert!(matches!(&frames[0], Frame::Text(t) if t.starts_with("Searching")));
    assert!(matches!(&frames[1], Frame::ToolStatus(_)));
    assert!(matches!(&frames[2], Frame::Text(t) if t.contains("---")));
    assert!(matches!(&frames[3], Frame::GraphData(_)));
}

#[test]
fn naive_concatenating_reader_gets_a_sensible_answer() {
    let stream = format!(
        "Part one. {}Part two.",
        encode_references(&serde_json::json!({"rich": [], "lean": []}))
    );
    assert_eq!(answer_body(&stream), "Part one. Part two.");
}

#[test]
fn malformed_frames_degrade_to_text_without_loss() {
    // A sentinel inside the JSON body truncates the frame, making its body
    // unparsable. The splitter must pass the raw bytes through as text
    // rather than dropping anything.
    let frame = encode_tool_status(&serde_json::json!({"note": "clients split on __END__"}));
    let frames = split_frames(&frame);
    assert!(frames.iter().all(|f| matches!(f, Frame::Text(_))));
    let reassembled: String = frames
        .into_iter()
        .map(|f| match f {
            Frame::Text(t) => t,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(reassembled, frame);
}
