//! Inspect command implementation.
//!
//! Summarizes a full-state dump, as returned by the hub's full data
//! endpoint.

use crate::error::CliError;
use easel_protocol::{EventPayload, EventType, FullState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Full-state inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Source file.
    pub path: String,
    /// Sequence number of the dump.
    pub sequence_id: u64,
    /// Whether a full document was uploaded.
    pub has_document: bool,
    /// Number of document objects.
    pub document_objects: usize,
    /// Document objects per category.
    pub categories: BTreeMap<String, usize>,
    /// Document objects without a category.
    pub uncategorized: usize,
    /// Number of trailing events.
    pub trailing_events: usize,
    /// `client:change` events.
    pub client_changes: usize,
    /// `client:change` events that delete an object.
    pub deletions: usize,
    /// `server:add_image` events.
    pub injections: usize,
    /// Events whose payload does not decode.
    pub malformed: usize,
    /// Clients that produced trailing events.
    pub clients: BTreeSet<String>,
    /// First and last trailing sequence numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_range: Option<(u64, u64)>,
    /// Sequence numbers missing between trailing events.
    pub missing_sequences: Vec<u64>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_clients: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect_file(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result, show_clients);
        }
    }

    Ok(())
}

/// Reads and summarizes a full-state file.
pub fn inspect_file(path: &Path) -> Result<InspectResult, CliError> {
    if !path.exists() {
        return Err(CliError::InvalidArgs(format!("No full-state file at {:?}", path)));
    }
    let bytes = std::fs::read(path)?;
    let state: FullState = serde_json::from_slice(&bytes)?;
    Ok(summarize(path.display().to_string(), &state))
}

/// Summarizes a full state.
pub fn summarize(path: String, state: &FullState) -> InspectResult {
    let mut result = InspectResult {
        path,
        sequence_id: state.sequence_id,
        has_document: state.document.is_some(),
        document_objects: 0,
        categories: BTreeMap::new(),
        uncategorized: 0,
        trailing_events: state.trailing_events.len(),
        client_changes: 0,
        deletions: 0,
        injections: 0,
        malformed: 0,
        clients: BTreeSet::new(),
        sequence_range: None,
        missing_sequences: Vec::new(),
    };

    for object in state.document.iter().flatten() {
        result.document_objects += 1;
        match object.category() {
            Some(category) if !category.is_empty() => {
                *result.categories.entry(category.to_string()).or_insert(0) += 1;
            }
            _ => result.uncategorized += 1,
        }
    }

    let events = state.sorted_trailing_events();
    for event in &events {
        match event.event_type {
            EventType::ClientChange => result.client_changes += 1,
            EventType::ServerAddImage => result.injections += 1,
        }
        match event.decode() {
            Ok(EventPayload::ClientChange(data)) => {
                if data.is_delete {
                    result.deletions += 1;
                }
                result.clients.insert(data.client_id);
            }
            Ok(EventPayload::AddImage(_)) => {}
            Err(_) => result.malformed += 1,
        }
    }

    if let (Some(first), Some(last)) = (events.first(), events.last()) {
        result.sequence_range = Some((first.sequence_id, last.sequence_id));
    }
    for pair in events.windows(2) {
        result
            .missing_sequences
            .extend(pair[0].sequence_id + 1..pair[1].sequence_id);
    }

    result
}

fn print_text_output(result: &InspectResult, show_clients: bool) {
    println!("Easel Full State Inspection");
    println!("===========================");
    println!();
    println!("Path:        {}", result.path);
    println!("Sequence ID: {}", result.sequence_id);
    println!();
    println!("Document:");
    if result.has_document {
        println!("  Objects:       {}", result.document_objects);
        for (category, count) in &result.categories {
            println!("    {:<12} {}", category, count);
        }
        if result.uncategorized > 0 {
            println!("  Uncategorized: {}", result.uncategorized);
        }
    } else {
        println!("  (never uploaded)");
    }
    println!();
    println!("Trailing events: {}", result.trailing_events);
    println!("  Client changes: {} ({} deletions)", result.client_changes, result.deletions);
    println!("  Injections:     {}", result.injections);
    if result.malformed > 0 {
        println!("  Malformed:      {}", result.malformed);
    }
    if let Some((first, last)) = result.sequence_range {
        println!("  Sequences:      {}..={}", first, last);
    }
    if !result.missing_sequences.is_empty() {
        println!("  Missing:        {:?}", result.missing_sequences);
    }

    if show_clients {
        println!();
        println!("Clients:");
        for client in &result.clients {
            println!("  {}", client);
        }
    }
}
