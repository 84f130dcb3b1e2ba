//! XML parsing for source client output.
//!
//! The source's XML-capable subcommands (`hist`, `show streams`, `diff`,
//! `show depots`) are parsed with an event reader. Payloads that get
//! committed to the metadata history first have their `TaskId` attribute
//! normalized to zero so identical command output across runs hashes
//! identically.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::model::{DepotId, StreamId, StreamKind, StreamRecord, Transaction, TxId, TxKind};

/// Rewrite every `TaskId="..."` attribute value to `0`.
pub fn normalize_task_id(xml: &str) -> String {
    const NEEDLE: &str = "TaskId=\"";
    let mut out = String::with_capacity(xml.len());
    let mut rest = xml;
    while let Some(pos) = rest.find(NEEDLE) {
        let after = &rest[pos + NEEDLE.len()..];
        match after.find('"') {
            Some(end) => {
                out.push_str(&rest[..pos]);
                out.push_str("TaskId=\"0\"");
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Source element paths arrive as `/./dir/file` (or backslashed); store
/// them repository-root relative with forward slashes.
pub fn normalize_element_path(raw: &str) -> String {
    let unified = raw.replace('\\', "/");
    let trimmed = unified
        .strip_prefix("/./")
        .or_else(|| unified.strip_prefix("./"))
        .unwrap_or(&unified);
    trimmed.trim_start_matches('/').to_string()
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &str, context: &str) -> Result<Option<String>> {
    match e.try_get_attribute(name) {
        Ok(Some(a)) => a
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|err| Error::parse(context, err.to_string())),
        Ok(None) => Ok(None),
        Err(err) => Err(Error::parse(context, err.to_string())),
    }
}

fn required_attr(
    e: &quick_xml::events::BytesStart<'_>,
    name: &str,
    context: &str,
) -> Result<String> {
    attr(e, name, context)?
        .ok_or_else(|| Error::parse(context, format!("missing attribute '{}'", name)))
}

fn numeric_attr(
    e: &quick_xml::events::BytesStart<'_>,
    name: &str,
    context: &str,
) -> Result<Option<u64>> {
    match attr(e, name, context)? {
        Some(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::parse(context, format!("attribute '{}' is not a number: {}", name, v))),
        None => Ok(None),
    }
}

/// Parse the transactions in a `hist` response.
pub fn parse_hist(xml: &str) -> Result<Vec<Transaction>> {
    const CTX: &str = "hist";
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut transactions = Vec::new();
    let mut current: Option<Transaction> = None;
    let mut in_comment = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                match e.name().as_ref() {
                    b"transaction" => {
                        // A self-closed <transaction/> produces no End
                        // event; flush it when the next one starts.
                        if let Some(tx) = current.take() {
                            transactions.push(tx);
                        }
                        let id = numeric_attr(e, "id", CTX)?
                            .ok_or_else(|| Error::parse(CTX, "transaction missing id"))?;
                        let kind = TxKind::parse(&required_attr(e, "type", CTX)?);
                        let time = attr(e, "time", CTX)?
                            .and_then(|t| t.parse::<i64>().ok())
                            .unwrap_or(0);
                        current = Some(Transaction {
                            id,
                            kind,
                            user: attr(e, "user", CTX)?.unwrap_or_default(),
                            time,
                            comment: String::new(),
                            stream: attr(e, "streamName", CTX)?,
                            from_stream: attr(e, "fromStreamName", CTX)?,
                            to_stream: attr(e, "toStreamName", CTX)?,
                            elements: Vec::new(),
                        });
                    }
                    b"comment" => in_comment = true,
                    b"version" => {
                        if let Some(tx) = current.as_mut() {
                            if let Some(path) = attr(e, "path", CTX)? {
                                tx.elements.push(normalize_element_path(&path));
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref t)) if in_comment => {
                if let Some(tx) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|err| Error::parse(CTX, err.to_string()))?;
                    tx.comment.push_str(&text);
                }
            }
            Ok(Event::CData(ref t)) if in_comment => {
                if let Some(tx) = current.as_mut() {
                    tx.comment
                        .push_str(&String::from_utf8_lossy(t.as_ref()));
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"comment" => in_comment = false,
                b"transaction" => {
                    in_comment = false;
                    if let Some(tx) = current.take() {
                        transactions.push(tx);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(Error::parse(CTX, err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    // Self-closed <transaction .../> elements never see an End event.
    if let Some(tx) = current.take() {
        transactions.push(tx);
    }

    Ok(transactions)
}

/// Parse a `show streams` snapshot.
pub fn parse_streams(xml: &str) -> Result<Vec<StreamRecord>> {
    const CTX: &str = "streams";
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut streams = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"stream" {
                    let id: StreamId = numeric_attr(e, "streamNumber", CTX)?
                        .or(numeric_attr(e, "id", CTX)?)
                        .ok_or_else(|| Error::parse(CTX, "stream missing id"))?;
                    streams.push(StreamRecord {
                        id,
                        name: required_attr(e, "name", CTX)?,
                        kind: StreamKind::parse(
                            attr(e, "type", CTX)?.as_deref().unwrap_or("normal"),
                        ),
                        basis: numeric_attr(e, "basisStreamNumber", CTX)?,
                        timelock: numeric_attr(e, "timelock", CTX)?.map(|t| t as TxId),
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(Error::parse(CTX, err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(streams)
}

/// Parse a `diff` response into the set of changed element paths,
/// sorted and deduplicated.
pub fn parse_diff(xml: &str) -> Result<Vec<String>> {
    const CTX: &str = "diff";
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut paths = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                // Both sides of a change are collected: a moved element
                // names different paths in Stream1 and Stream2 and both
                // locations need refreshing.
                if matches!(e.name().as_ref(), b"Stream1" | b"Stream2") {
                    if let Some(name) = attr(e, "Name", CTX)? {
                        paths.push(normalize_element_path(&name));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(Error::parse(CTX, err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Parse a `show depots` response into `(name, id)` pairs.
pub fn parse_depots(xml: &str) -> Result<Vec<(String, DepotId)>> {
    const CTX: &str = "depots";
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depots = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"Element" || e.name().as_ref() == b"depot" {
                    let name = required_attr(e, "Name", CTX)
                        .or_else(|_| required_attr(e, "name", CTX))?;
                    let id = numeric_attr(e, "Number", CTX)?
                        .or(numeric_attr(e, "number", CTX)?)
                        .ok_or_else(|| Error::parse(CTX, "depot missing number"))?;
                    depots.push((name, id));
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(Error::parse(CTX, err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(depots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_task_id() {
        let xml = r#"<AcResponse Command="hist" TaskId="4711"><x TaskId="9"/></AcResponse>"#;
        let normalized = normalize_task_id(xml);
        assert_eq!(
            normalized,
            r#"<AcResponse Command="hist" TaskId="0"><x TaskId="0"/></AcResponse>"#
        );
        // Stable under repetition.
        assert_eq!(normalize_task_id(&normalized), normalized);
    }

    #[test]
    fn test_normalize_element_path() {
        assert_eq!(normalize_element_path("/./src/main.rs"), "src/main.rs");
        assert_eq!(normalize_element_path("\\.\\src\\main.rs"), "src/main.rs");
        assert_eq!(normalize_element_path("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_parse_hist_promote() {
        let xml = r#"<AcResponse Command="hist" TaskId="7">
  <transaction id="12" type="promote" time="1426000000" user="joe" streamName="Test" fromStreamName="Dev" toStreamName="Test">
    <comment>fix the build</comment>
    <version path="/./src/a.c" eid="4" virtual="3/2" real="2/8"/>
    <version path="/./src/b.c" eid="5" virtual="3/3" real="2/9"/>
  </transaction>
</AcResponse>"#;
        let txs = parse_hist(xml).unwrap();
        assert_eq!(txs.len(), 1);
        let tx = &txs[0];
        assert_eq!(tx.id, 12);
        assert_eq!(tx.kind, TxKind::Promote);
        assert_eq!(tx.user, "joe");
        assert_eq!(tx.time, 1426000000);
        assert_eq!(tx.comment, "fix the build");
        assert_eq!(tx.from_stream.as_deref(), Some("Dev"));
        assert_eq!(tx.to_stream.as_deref(), Some("Test"));
        assert_eq!(tx.elements, vec!["src/a.c", "src/b.c"]);
    }

    #[test]
    fn test_parse_hist_old_history_without_source() {
        let xml = r#"<AcResponse Command="hist">
  <transaction id="77" type="promote" time="100" user="kim" toStreamName="Release"/>
</AcResponse>"#;
        let txs = parse_hist(xml).unwrap();
        assert_eq!(txs.len(), 1);
        assert!(txs[0].from_stream.is_none());
        assert_eq!(txs[0].to_stream.as_deref(), Some("Release"));
        assert!(txs[0].comment.is_empty());
    }

    #[test]
    fn test_parse_hist_rejects_garbage() {
        assert!(parse_hist("<transaction id=\"x\" type=\"keep\"/>").is_err());
        assert!(parse_hist("<a><unclosed></a>").is_err());
    }

    #[test]
    fn test_parse_streams() {
        let xml = r#"<AcResponse Command="show streams" TaskId="3">
  <stream id="1" name="Main" type="normal"/>
  <stream id="2" name="Dev" type="normal" basisStreamNumber="1" timelock="40"/>
  <stream id="5" name="joe_ws" type="workspace" basisStreamNumber="2"/>
</AcResponse>"#;
        let streams = parse_streams(xml).unwrap();
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[0].basis, None);
        assert_eq!(streams[1].basis, Some(1));
        assert_eq!(streams[1].timelock, Some(40));
        assert_eq!(streams[2].kind, StreamKind::Workspace);
    }

    #[test]
    fn test_parse_diff_collects_both_sides() {
        let xml = r#"<AcResponse Command="diff">
  <element>
    <Change What="content">
      <Stream1 Name="/./a.txt" Version="1/2"/>
      <Stream2 Name="/./a.txt" Version="3/4"/>
    </Change>
  </element>
  <element>
    <Change What="moved">
      <Stream1 Name="/./old/name.txt"/>
      <Stream2 Name="/./new/name.txt"/>
    </Change>
  </element>
</AcResponse>"#;
        let paths = parse_diff(xml).unwrap();
        assert_eq!(paths, vec!["a.txt", "new/name.txt", "old/name.txt"]);
    }

    #[test]
    fn test_parse_diff_empty() {
        let paths = parse_diff(r#"<AcResponse Command="diff"/>"#).unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn test_parse_depots() {
        let xml = r#"<AcResponse Command="show depots" TaskId="1">
  <Element Number="1" Name="Trunk"/>
  <Element Number="4" Name="Tools"/>
</AcResponse>"#;
        let depots = parse_depots(xml).unwrap();
        assert_eq!(depots, vec![("Trunk".to_string(), 1), ("Tools".to_string(), 4)]);
    }
}
