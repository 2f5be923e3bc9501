//! Per-type preprocessors.
//!
//! Preprocessors run inside the pipeline's write batch, after a command
//! has been merged into its target entity and before the entity store
//! writes the new revision. They derive indexed properties (mail
//! headers, event fields, thread linkage), route entities (special
//! purpose folders), and may enqueue follow-up create commands
//! (auto-created folders).
//!
//! Reads during preprocessing go through the batch's read snapshot;
//! entities written earlier in the same uncommitted batch are covered by
//! small per-batch caches inside the processors that need them.

use std::collections::HashMap;
use std::fs;

use tracing::{debug, warn};

use super::Command;
use crate::entity::{Entity, EntityReader};
use crate::error::Result;
use crate::types::{EntityId, PropertyName, Timestamp};
use crate::value::{PropertyMap, Value};

/// What the pipeline should do with the current command after a
/// preprocessor ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Proceed with the write.
    Keep,
    /// Silently drop the modification (no revision is created).
    Drop,
    /// Turn the operation into a local delete of the entity.
    DeleteEntity,
    /// Ship a copy of the entity to another resource and delete it
    /// locally (a move).
    MoveToResource(String),
    /// Ship a copy of the entity to another resource and keep it.
    CopyToResource(String),
}

/// An entry for a composite lookup tree (e.g. messageId → threadId),
/// written by the pipeline after the current command succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupWrite {
    /// Lookup tree name within the entity type's namespace.
    pub name: String,
    /// Lookup key bytes.
    pub key: Vec<u8>,
    /// Lookup value bytes.
    pub value: Vec<u8>,
}

/// Read access and the follow-up command sink available to
/// preprocessors.
pub struct PreprocessContext<'a> {
    /// Snapshot of the committed state at batch start.
    pub reader: &'a EntityReader,
    /// Create commands to apply after the current command, in the same
    /// batch.
    pub followups: &'a mut Vec<Command>,
    /// Composite lookup entries to persist with the current command.
    pub lookups: &'a mut Vec<LookupWrite>,
}

/// A per-type write hook.
///
/// Implementations are registered on the pipeline per entity type and
/// invoked in registration order. Default implementations keep the
/// entity untouched.
pub trait Preprocessor: Send {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Called once when a batch transaction opens.
    fn start_batch(&mut self) {}

    /// Called for each freshly created entity.
    fn new_entity(&mut self, entity: &mut Entity, ctx: &mut PreprocessContext<'_>)
        -> Result<Action> {
        let _ = (entity, ctx);
        Ok(Action::Keep)
    }

    /// Called for each modification with the previous and the merged
    /// successor record.
    fn modified_entity(
        &mut self,
        old: &Entity,
        new: &mut Entity,
        ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        let _ = (old, new, ctx);
        Ok(Action::Keep)
    }

    /// Called before a tombstone is written.
    fn deleted_entity(&mut self, old: &Entity, ctx: &mut PreprocessContext<'_>) -> Result<()> {
        let _ = (old, ctx);
        Ok(())
    }

    /// Called before the batch commits.
    fn finalize_batch(&mut self) {}
}

// ============================================================================
// Calendar date helpers
// ============================================================================

/// Days from civil date per the standard era-based calendar algorithm.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let yoe = year - era * 400;
    let mp = i64::from((month + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Unix milliseconds for a UTC civil datetime.
fn epoch_millis(year: i64, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> i64 {
    let days = days_from_civil(year, month, day);
    (days * 86_400 + i64::from(hour) * 3_600 + i64::from(minute) * 60 + i64::from(second)) * 1_000
}

fn month_from_name(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| lower.starts_with(m))
        .map(|i| i as u32 + 1)
}

/// Parses an RFC 2822 date header like `Tue, 1 Jul 2003 10:52:37 +0200`.
///
/// Returns `None` for anything it cannot make sense of; the date
/// property is simply left unset then.
fn parse_rfc2822_date(input: &str) -> Option<Timestamp> {
    let input = input.trim();
    // Strip the optional weekday prefix.
    let rest = match input.find(',') {
        Some(pos) => input[pos + 1..].trim(),
        None => input,
    };
    let mut tokens = rest.split_whitespace();

    let day: u32 = tokens.next()?.parse().ok()?;
    let month = month_from_name(tokens.next()?)?;
    let year: i64 = {
        let raw: i64 = tokens.next()?.parse().ok()?;
        // Two-digit years per RFC 2822 obsolete syntax.
        if raw < 50 {
            raw + 2000
        } else if raw < 1000 {
            raw + 1900
        } else {
            raw
        }
    };

    let time = tokens.next()?;
    let mut parts = time.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    let second: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let offset_minutes: i64 = match tokens.next() {
        Some(zone) if zone.len() == 5 && (zone.starts_with('+') || zone.starts_with('-')) => {
            let sign = if zone.starts_with('-') { -1 } else { 1 };
            let hours: i64 = zone[1..3].parse().ok()?;
            let minutes: i64 = zone[3..5].parse().ok()?;
            sign * (hours * 60 + minutes)
        }
        // Named zones (UT, GMT, EST, ...) and missing zones are treated
        // as UTC; good enough for sorting and threading.
        _ => 0,
    };

    let millis = epoch_millis(year, month, day, hour, minute, second) - offset_minutes * 60_000;
    Some(Timestamp::from_millis(millis))
}

/// Parses an iCalendar date or datetime (`20230401`, `20230401T120000Z`).
fn parse_ical_datetime(input: &str) -> Option<Timestamp> {
    let input = input.trim();
    if input.len() < 8 {
        return None;
    }
    let year: i64 = input.get(0..4)?.parse().ok()?;
    let month: u32 = input.get(4..6)?.parse().ok()?;
    let day: u32 = input.get(6..8)?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let (hour, minute, second) = if input.len() >= 15 && input.as_bytes().get(8) == Some(&b'T') {
        (
            input.get(9..11)?.parse().ok()?,
            input.get(11..13)?.parse().ok()?,
            input.get(13..15)?.parse().ok()?,
        )
    } else {
        (0, 0, 0)
    };

    Some(Timestamp::from_millis(epoch_millis(
        year, month, day, hour, minute, second,
    )))
}

// ============================================================================
// Mail property extraction
// ============================================================================

/// Derives indexed mail properties from the raw `mimeMessage` payload.
///
/// Extracts subject, sender, date, message id and parent message ids by
/// header scanning, and a plain-text body for full-text filtering. A
/// missing message id is replaced by a generated one so threading always
/// has something to anchor on.
#[derive(Debug, Default)]
pub struct MailPropertyExtractor;

struct ParsedMessage {
    headers: Vec<(String, String)>,
    body: String,
}

impl ParsedMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Splits a message into unfolded headers and body.
fn parse_message(raw: &[u8]) -> ParsedMessage {
    let text = String::from_utf8_lossy(raw);
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body = String::new();
    let mut in_body = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if in_body {
            body.push_str(trimmed);
            body.push('\n');
            continue;
        }
        if trimmed.is_empty() {
            in_body = true;
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header.
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(trimmed.trim_start());
            }
            continue;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    ParsedMessage {
        headers,
        body: body.trim_end().to_string(),
    }
}

/// Splits `Name <addr@host>` into (name, address).
fn parse_mailbox(input: &str) -> (String, String) {
    let input = input.trim();
    if let (Some(start), Some(end)) = (input.find('<'), input.rfind('>')) {
        if start < end {
            let name = input[..start].trim().trim_matches('"').to_string();
            let address = input[start + 1..end].trim().to_string();
            return (name, address);
        }
    }
    (String::new(), input.to_string())
}

/// Extracts `<...>` message-id tokens from a References-style header.
fn parse_message_ids(input: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        ids.push(rest[start..start + len + 1].to_string());
        rest = &rest[start + len + 1..];
    }
    ids
}

impl MailPropertyExtractor {
    fn extract(&self, mail: &mut Entity) -> Result<()> {
        let raw = match mail.get("mimeMessage") {
            Some(Value::Bytes(bytes)) => bytes.clone(),
            Some(Value::Blob(path)) => fs::read(path)?,
            _ => return Ok(()),
        };
        let message = parse_message(&raw);

        if let Some(subject) = message.header("Subject") {
            mail.set("subject", Value::String(subject.to_string()));
        }
        if let Some(from) = message.header("From") {
            let (name, address) = parse_mailbox(from);
            mail.set("sender", Value::String(address));
            if !name.is_empty() {
                mail.set("senderName", Value::String(name));
            }
        }
        if let Some(date) = message.header("Date").and_then(parse_rfc2822_date) {
            mail.set("date", Value::Timestamp(date));
        }
        if !message.body.is_empty() {
            mail.set("plainTextBody", Value::String(message.body.clone()));
        }

        // References carries the whole ancestry; In-Reply-To only the
        // immediate parent, and only its first id is trustworthy.
        let parents = match message.header("References") {
            Some(refs) => parse_message_ids(refs),
            None => message
                .header("In-Reply-To")
                .map(parse_message_ids)
                .unwrap_or_default()
                .into_iter()
                .take(1)
                .collect(),
        };
        if !parents.is_empty() {
            mail.set(
                "parentMessageIds",
                Value::List(parents.into_iter().map(Value::String).collect()),
            );
        }

        let message_id = message
            .header("Message-ID")
            .and_then(|h| parse_message_ids(h).into_iter().next());
        match message_id {
            Some(id) => mail.set("messageId", Value::String(id)),
            None => {
                // Keep an existing id on modification, otherwise mint one.
                if mail.get("messageId").is_none() {
                    let generated = format!("<{}@estuary>", EntityId::new());
                    warn!(mail = %mail.id(), "message id missing, generated {}", generated);
                    mail.set("messageId", Value::String(generated));
                }
            }
        }
        Ok(())
    }
}

impl Preprocessor for MailPropertyExtractor {
    fn name(&self) -> &str {
        "mail-property-extractor"
    }

    fn new_entity(
        &mut self,
        entity: &mut Entity,
        _ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        self.extract(entity)?;
        Ok(Action::Keep)
    }

    fn modified_entity(
        &mut self,
        _old: &Entity,
        new: &mut Entity,
        _ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        if new
            .metadata
            .changed_properties
            .contains(&PropertyName::new("mimeMessage"))
        {
            self.extract(new)?;
        }
        Ok(Action::Keep)
    }
}

// ============================================================================
// Thread linkage
// ============================================================================

/// Assigns `threadId` from parent linkage.
///
/// A mail joins its parent's thread when one of its parent message ids
/// is already known; a mail whose own message id is referenced by an
/// existing orphan adopts that orphan's thread. Otherwise a fresh thread
/// id is minted. A per-batch cache covers mails written earlier in the
/// same uncommitted batch.
#[derive(Debug, Default)]
pub struct ThreadIndexer {
    batch_threads: HashMap<String, String>,
}

/// Name of the messageId → threadId lookup tree.
const THREAD_LOOKUP: &str = "threads";

impl ThreadIndexer {
    fn thread_of_message(
        &self,
        message_id: &str,
        ctx: &PreprocessContext<'_>,
    ) -> Result<Option<String>> {
        if let Some(thread) = self.batch_threads.get(message_id) {
            return Ok(Some(thread.clone()));
        }
        let mail_type = crate::types::EntityType::new("mail");
        // The committed messageId → threadId lookup answers directly.
        if let Some(bytes) = ctx
            .reader
            .lookup_get(&mail_type, THREAD_LOOKUP, message_id.as_bytes())?
        {
            return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
        }
        Ok(None)
    }

    fn thread_of_children(
        &self,
        message_id: &str,
        ctx: &PreprocessContext<'_>,
    ) -> Result<Option<String>> {
        let mail_type = crate::types::EntityType::new("mail");
        let children = ctx.reader.index_lookup(
            &mail_type,
            &PropertyName::new("parentMessageIds"),
            &Value::String(message_id.to_string()),
        )?;
        for id in children {
            if let Some(mail) = ctx.reader.read_latest(&mail_type, &id)? {
                if let Some(thread) = mail.get("threadId").and_then(Value::as_str) {
                    return Ok(Some(thread.to_string()));
                }
            }
        }
        Ok(None)
    }

    fn assign_thread(&mut self, mail: &mut Entity, ctx: &mut PreprocessContext<'_>) -> Result<()> {
        let Some(message_id) = mail.get("messageId").and_then(Value::as_str).map(String::from)
        else {
            return Ok(());
        };

        let parents: Vec<String> = mail
            .get("parentMessageIds")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut thread = None;
        for parent in &parents {
            if let Some(found) = self.thread_of_message(parent, ctx)? {
                thread = Some(found);
                break;
            }
        }
        if thread.is_none() {
            // We may be the missing parent of already-delivered replies.
            thread = self.thread_of_children(&message_id, ctx)?;
        }
        let thread = thread.unwrap_or_else(|| EntityId::new().to_string());

        debug!(mail = %mail.id(), thread = %thread, "assigned thread");
        mail.set("threadId", Value::String(thread.clone()));
        ctx.lookups.push(LookupWrite {
            name: THREAD_LOOKUP.to_string(),
            key: message_id.clone().into_bytes(),
            value: thread.clone().into_bytes(),
        });
        self.batch_threads.insert(message_id, thread);
        Ok(())
    }
}

impl Preprocessor for ThreadIndexer {
    fn name(&self) -> &str {
        "thread-indexer"
    }

    fn start_batch(&mut self) {
        self.batch_threads.clear();
    }

    fn new_entity(
        &mut self,
        entity: &mut Entity,
        ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        self.assign_thread(entity, ctx)?;
        Ok(Action::Keep)
    }

    fn modified_entity(
        &mut self,
        _old: &Entity,
        new: &mut Entity,
        ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        if new.get("threadId").is_none() {
            self.assign_thread(new, ctx)?;
        }
        Ok(Action::Keep)
    }
}

// ============================================================================
// Special-purpose folders
// ============================================================================

/// Folder names recognized as special purpose.
const SPECIAL_PURPOSE_FOLDERS: [(&str, &str); 4] = [
    ("drafts", "drafts"),
    ("trash", "trash"),
    ("sent", "sent"),
    ("inbox", "inbox"),
];

/// Returns the special purpose for a folder name, if any.
pub fn special_purpose_for_name(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    SPECIAL_PURPOSE_FOLDERS
        .iter()
        .find(|(folder, _)| *folder == lower)
        .map(|(_, purpose)| *purpose)
}

/// Tags special folders and routes flagged mail into them.
///
/// Folders whose name matches a known special purpose get a
/// `specialpurpose` property. Mail flagged `draft` or `trash` is
/// directed into the matching folder; when no such folder exists yet, a
/// create command for one is enqueued in the same batch.
#[derive(Debug, Default)]
pub struct SpecialPurposeProcessor {
    folder_cache: HashMap<String, EntityId>,
}

impl SpecialPurposeProcessor {
    fn ensure_folder(
        &mut self,
        purpose: &str,
        ctx: &mut PreprocessContext<'_>,
    ) -> Result<EntityId> {
        if let Some(id) = self.folder_cache.get(purpose) {
            return Ok(*id);
        }

        let folder_type = crate::types::EntityType::new("folder");
        let existing = ctx.reader.index_lookup(
            &folder_type,
            &PropertyName::new("specialpurpose"),
            &Value::String(purpose.to_string()),
        )?;
        if let Some(id) = existing.first() {
            self.folder_cache.insert(purpose.to_string(), *id);
            return Ok(*id);
        }

        // Auto-create the folder in the same batch; picking the id here
        // lets the mail reference it immediately.
        let id = EntityId::new();
        let mut properties = PropertyMap::new();
        properties.set("name", Value::String(purpose.to_string()));
        properties.set("specialpurpose", Value::String(purpose.to_string()));
        ctx.followups.push(Command::Create {
            entity_type: crate::types::EntityType::new("folder"),
            id: Some(id),
            properties,
            replay_to_source: true,
        });
        debug!(purpose, folder = %id, "auto-creating special purpose folder");
        self.folder_cache.insert(purpose.to_string(), id);
        Ok(id)
    }

    fn route_mail(&mut self, mail: &mut Entity, ctx: &mut PreprocessContext<'_>) -> Result<()> {
        let wanted = if mail.get("trash").and_then(Value::as_bool).unwrap_or(false) {
            Some("trash")
        } else if mail.get("draft").and_then(Value::as_bool).unwrap_or(false) {
            Some("drafts")
        } else if mail.get("sent").and_then(Value::as_bool).unwrap_or(false) {
            Some("sent")
        } else {
            None
        };
        if let Some(purpose) = wanted {
            let folder = self.ensure_folder(purpose, ctx)?;
            mail.set("folder", Value::IdRef(folder));
        }
        Ok(())
    }
}

impl Preprocessor for SpecialPurposeProcessor {
    fn name(&self) -> &str {
        "special-purpose"
    }

    fn new_entity(
        &mut self,
        entity: &mut Entity,
        ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        match entity.entity_type().as_str() {
            "folder" => {
                if entity.get("specialpurpose").is_none() {
                    if let Some(purpose) = entity
                        .get("name")
                        .and_then(Value::as_str)
                        .and_then(special_purpose_for_name)
                    {
                        entity.set("specialpurpose", Value::String(purpose.to_string()));
                    }
                }
            }
            "mail" => self.route_mail(entity, ctx)?,
            _ => {}
        }
        Ok(Action::Keep)
    }

    fn modified_entity(
        &mut self,
        _old: &Entity,
        new: &mut Entity,
        ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        if new.entity_type().as_str() == "mail" {
            let flags_changed = ["draft", "trash", "sent"].iter().any(|flag| {
                new.metadata
                    .changed_properties
                    .contains(&PropertyName::new(*flag))
            });
            if flags_changed {
                self.route_mail(new, ctx)?;
            }
        }
        Ok(Action::Keep)
    }
}

// ============================================================================
// Event property extraction
// ============================================================================

/// Derives indexed event properties from an iCalendar payload.
///
/// Reads `UID`, `SUMMARY`, `DTSTART`, `DTEND` and `RRULE` from the
/// `ical` property. Explicitly set properties win over extracted ones.
#[derive(Debug, Default)]
pub struct EventPropertyExtractor;

impl EventPropertyExtractor {
    fn extract(&self, event: &mut Entity) -> Result<()> {
        let raw = match event.get("ical") {
            Some(Value::Bytes(bytes)) => bytes.clone(),
            Some(Value::Blob(path)) => fs::read(path)?,
            _ => return Ok(()),
        };
        let text = String::from_utf8_lossy(&raw).into_owned();

        let mut recurring = false;
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            // Property parameters (DTSTART;TZID=...) are ignored.
            let name = name.split(';').next().unwrap_or(name).to_ascii_uppercase();
            match name.as_str() {
                "UID" => {
                    if event.get("uid").is_none() {
                        event.set("uid", Value::String(value.trim().to_string()));
                    }
                }
                "SUMMARY" => {
                    if event.get("summary").is_none() {
                        event.set("summary", Value::String(value.trim().to_string()));
                    }
                }
                "DTSTART" => {
                    if let Some(ts) = parse_ical_datetime(value) {
                        event.set("dtStart", Value::Timestamp(ts));
                    }
                }
                "DTEND" => {
                    if let Some(ts) = parse_ical_datetime(value) {
                        event.set("dtEnd", Value::Timestamp(ts));
                    }
                }
                "RRULE" => recurring = true,
                _ => {}
            }
        }
        event.set("recurring", Value::Bool(recurring));
        Ok(())
    }
}

impl Preprocessor for EventPropertyExtractor {
    fn name(&self) -> &str {
        "event-property-extractor"
    }

    fn new_entity(
        &mut self,
        entity: &mut Entity,
        _ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        self.extract(entity)?;
        Ok(Action::Keep)
    }

    fn modified_entity(
        &mut self,
        _old: &Entity,
        new: &mut Entity,
        _ctx: &mut PreprocessContext<'_>,
    ) -> Result<Action> {
        if new
            .metadata
            .changed_properties
            .contains(&PropertyName::new("ical"))
        {
            self.extract(new)?;
        }
        Ok(Action::Keep)
    }
}
