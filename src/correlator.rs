//! Exchange correlation: folds lifecycle events into exchange records.
//!
//! Each exchange id moves through request-initiated, response-metadata and
//! loading-finished independently of every other id. A stage whose
//! predecessor was never seen starts from a placeholder record instead of
//! failing, and replaying a stage merges to the same record.

use std::collections::{HashMap, hash_map::Entry};

use crate::{
    classify::ContentTypeTag,
    event::{LoadingFinished, NetworkEvent, RequestInitiated, ResponseBody, ResponseMetadata},
    storage::{CapturedExchange, Headers},
};

pub const PLACEHOLDER_METHOD: &str = "GET";
pub const PLACEHOLDER_URL: &str = "Unknown";
pub const PLACEHOLDER_RESOURCE_TYPE: &str = "Other";

/// Minimal record standing in for an exchange whose request start was missed.
pub fn placeholder(session_id: &str, exchange_id: &str, observed_at: f64) -> CapturedExchange {
    CapturedExchange {
        exchange_id: exchange_id.to_owned(),
        session_id: session_id.to_owned(),
        resource_type: PLACEHOLDER_RESOURCE_TYPE.to_owned(),
        method: PLACEHOLDER_METHOD.to_owned(),
        url: PLACEHOLDER_URL.to_owned(),
        request_headers: Headers::new(),
        request_body: None,
        request_observed: false,
        response_status: None,
        response_status_text: None,
        response_headers: None,
        mime_type: None,
        content_type: ContentTypeTag::Unknown,
        encoded_body_size: None,
        body: None,
        body_is_binary: None,
        observed_at,
    }
}

/// Next state of an exchange given its current record (if any) and an event.
pub fn apply_event(
    current: Option<&CapturedExchange>,
    session_id: &str,
    event: &NetworkEvent,
) -> CapturedExchange {
    match event {
        NetworkEvent::RequestInitiated(request) => apply_request(current, session_id, request),
        NetworkEvent::ResponseMetadata(response) => {
            let mut next = current.cloned().unwrap_or_else(|| {
                placeholder(session_id, &response.exchange_id, response.timestamp)
            });
            merge_response(&mut next, response);
            next
        }
        NetworkEvent::LoadingFinished(finished) => {
            let mut next = current.cloned().unwrap_or_else(|| {
                placeholder(session_id, &finished.exchange_id, finished.timestamp)
            });
            merge_finished(&mut next, finished);
            next
        }
    }
}

/// Record with a retrieved body merged in.
pub fn apply_body(current: &CapturedExchange, body: &ResponseBody) -> CapturedExchange {
    let mut next = current.clone();
    next.body = Some(body.body.clone());
    next.body_is_binary = Some(body.is_binary);
    next
}

fn apply_request(
    current: Option<&CapturedExchange>,
    session_id: &str,
    request: &RequestInitiated,
) -> CapturedExchange {
    match current {
        // request fields are immutable once observed
        Some(existing) if existing.request_observed => existing.clone(),
        Some(existing) => {
            let mut next = existing.clone();
            fill_request(&mut next, request);
            next
        }
        None => {
            let mut next = placeholder(session_id, &request.exchange_id, request.timestamp);
            fill_request(&mut next, request);
            next
        }
    }
}

fn fill_request(record: &mut CapturedExchange, request: &RequestInitiated) {
    if let Some(resource_type) = request.resource_type.as_ref() {
        record.resource_type = resource_type.clone();
    }
    record.method = request.method.clone();
    record.url = request.url.clone();
    record.request_headers = request.headers.clone();
    record.request_body = request.body.clone();
    record.request_observed = true;
    record.observed_at = record.observed_at.min(request.timestamp);
}

fn merge_response(record: &mut CapturedExchange, response: &ResponseMetadata) {
    record.response_status = Some(response.status);
    record.response_status_text = Some(response.status_text.clone());
    record.response_headers = Some(response.headers.clone());
    if !response.mime_type.is_empty() {
        record.mime_type = Some(response.mime_type.clone());
    }
    record.content_type = record.content_type.resolve_response(&response.mime_type);
}

fn merge_finished(record: &mut CapturedExchange, finished: &LoadingFinished) {
    record.encoded_body_size = Some(finished.encoded_data_length);
}

/// Outcome of one event: the merged record and the I/O it calls for.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub record: CapturedExchange,
    pub persist: bool,
    pub fetch_body: bool,
}

/// In-memory working set of one capture session.
#[derive(Debug)]
pub struct Correlator {
    session_id: String,
    exchanges: HashMap<String, CapturedExchange>,
}

impl Correlator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            exchanges: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Loads records persisted earlier so later stages merge into them
    /// instead of a fresh placeholder. Records of other sessions are ignored;
    /// an id already tracked in memory keeps its in-memory state.
    pub fn seed(&mut self, records: impl IntoIterator<Item = CapturedExchange>) -> usize {
        let mut seeded = 0;
        for record in records {
            if record.session_id != self.session_id {
                continue;
            }
            if let Entry::Vacant(slot) = self.exchanges.entry(record.exchange_id.clone()) {
                slot.insert(record);
                seeded += 1;
            }
        }
        seeded
    }

    pub fn get(&self, exchange_id: &str) -> Option<&CapturedExchange> {
        self.exchanges.get(exchange_id)
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Applies `event` to its exchange and reports whether the merged record
    /// should be written and whether its body should be fetched.
    ///
    /// A request start is held in memory only; it is written once a later
    /// stage has already made the record durable.
    pub fn observe(&mut self, event: &NetworkEvent) -> Transition {
        let current = self.exchanges.get(event.exchange_id());
        let next = apply_event(current, &self.session_id, event);

        let (persist, fetch_body) = match event {
            NetworkEvent::RequestInitiated(_) => {
                let durable = current.is_some_and(|record| {
                    record.response_status.is_some() || record.encoded_body_size.is_some()
                });
                (durable && current != Some(&next), false)
            }
            NetworkEvent::ResponseMetadata(_) => (true, false),
            NetworkEvent::LoadingFinished(_) => (true, true),
        };

        self.exchanges
            .insert(event.exchange_id().to_owned(), next.clone());
        Transition {
            record: next,
            persist,
            fetch_body,
        }
    }

    /// Merges a retrieved body. `None` when the exchange is no longer tracked.
    pub fn attach_body(
        &mut self,
        exchange_id: &str,
        body: &ResponseBody,
    ) -> Option<CapturedExchange> {
        let record = self.exchanges.get_mut(exchange_id)?;
        *record = apply_body(record, body);
        Some(record.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Correlator, PLACEHOLDER_METHOD, PLACEHOLDER_URL, apply_body, apply_event};
    use crate::{
        classify::ContentTypeTag,
        event::{LoadingFinished, NetworkEvent, RequestInitiated, ResponseBody, ResponseMetadata},
        storage::Headers,
    };

    pub(crate) fn request(id: &str, url: &str, timestamp: f64) -> NetworkEvent {
        NetworkEvent::RequestInitiated(RequestInitiated {
            exchange_id: id.to_owned(),
            resource_type: Some("Script".to_owned()),
            method: "POST".to_owned(),
            url: url.to_owned(),
            timestamp,
            headers: Headers::from([("accept".to_owned(), "*/*".to_owned())]),
            body: Some("q=1".to_owned()),
        })
    }

    pub(crate) fn response(id: &str, mime_type: &str, timestamp: f64) -> NetworkEvent {
        NetworkEvent::ResponseMetadata(ResponseMetadata {
            exchange_id: id.to_owned(),
            status: 200,
            status_text: "OK".to_owned(),
            headers: Headers::from([("content-type".to_owned(), mime_type.to_owned())]),
            mime_type: mime_type.to_owned(),
            timestamp,
        })
    }

    pub(crate) fn finished(id: &str, length: u64, timestamp: f64) -> NetworkEvent {
        NetworkEvent::LoadingFinished(LoadingFinished {
            exchange_id: id.to_owned(),
            encoded_data_length: length,
            timestamp,
        })
    }

    fn fold(events: &[NetworkEvent]) -> Correlator {
        let mut correlator = Correlator::new("tab-1");
        for event in events {
            correlator.observe(event);
        }
        correlator
    }

    #[test]
    fn full_order_produces_the_union_of_fields() {
        let correlator = fold(&[
            request("1", "https://example.com/app.js", 1.0),
            response("1", "application/javascript", 1.1),
            finished("1", 2048, 1.2),
        ]);

        let record = correlator.get("1").unwrap();
        assert!(record.request_observed);
        assert_eq!(record.method, "POST");
        assert_eq!(record.url, "https://example.com/app.js");
        assert_eq!(record.resource_type, "Script");
        assert_eq!(record.request_body.as_deref(), Some("q=1"));
        assert_eq!(record.response_status, Some(200));
        assert_eq!(record.mime_type.as_deref(), Some("application/javascript"));
        assert_eq!(record.content_type, ContentTypeTag::Javascript);
        assert_eq!(record.encoded_body_size, Some(2048));
        assert_eq!(record.observed_at, 1.0);
    }

    #[test]
    fn response_without_request_synthesizes_a_placeholder() {
        let correlator = fold(&[response("9", "image/png", 5.0), finished("9", 10, 5.1)]);

        let record = correlator.get("9").unwrap();
        assert!(!record.request_observed);
        assert_eq!(record.method, PLACEHOLDER_METHOD);
        assert_eq!(record.url, PLACEHOLDER_URL);
        assert!(record.request_headers.is_empty());
        assert_eq!(record.content_type, ContentTypeTag::Image);
        assert_eq!(record.encoded_body_size, Some(10));
        assert_eq!(record.observed_at, 5.0);
    }

    #[test]
    fn finished_without_predecessors_keeps_the_tag_unknown() {
        let correlator = fold(&[finished("3", 77, 2.0)]);

        let record = correlator.get("3").unwrap();
        assert_eq!(record.url, PLACEHOLDER_URL);
        assert_eq!(record.response_status, None);
        assert_eq!(record.content_type, ContentTypeTag::Unknown);
        assert_eq!(record.encoded_body_size, Some(77));
    }

    #[test]
    fn tag_never_returns_to_unknown_after_a_response() {
        let correlator = fold(&[
            response("1", "text/css", 1.0),
            response("1", "", 1.1),
            finished("1", 5, 1.2),
        ]);
        let record = correlator.get("1").unwrap();
        assert_eq!(record.content_type, ContentTypeTag::Css);
        assert_eq!(record.mime_type.as_deref(), Some("text/css"));

        let untyped = fold(&[response("2", "", 1.0)]);
        assert_eq!(untyped.get("2").unwrap().content_type, ContentTypeTag::Other);
    }

    #[test]
    fn late_request_fills_a_placeholder_once() {
        let mut correlator = fold(&[
            response("1", "text/html", 2.0),
            request("1", "https://example.com/", 1.5),
        ]);
        let record = correlator.get("1").unwrap().clone();
        assert!(record.request_observed);
        assert_eq!(record.url, "https://example.com/");
        assert_eq!(record.response_status, Some(200));
        assert_eq!(record.observed_at, 1.5);

        let transition = correlator.observe(&request("1", "https://example.com/other", 3.0));
        assert_eq!(transition.record, record);
        assert!(!transition.persist);
    }

    #[test]
    fn late_request_on_a_durable_record_is_persisted() {
        let mut correlator = fold(&[response("1", "text/html", 2.0)]);
        let transition = correlator.observe(&request("1", "https://example.com/", 1.0));
        assert!(transition.persist);
        assert!(!transition.fetch_body);
    }

    #[test]
    fn only_later_stages_are_persisted_and_finish_fetches_the_body() {
        let mut correlator = Correlator::new("tab-1");

        let start = correlator.observe(&request("1", "https://example.com/", 1.0));
        assert!(!start.persist && !start.fetch_body);
        let metadata = correlator.observe(&response("1", "text/html", 1.1));
        assert!(metadata.persist && !metadata.fetch_body);
        let done = correlator.observe(&finished("1", 3, 1.2));
        assert!(done.persist && done.fetch_body);
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn replaying_a_finalized_sequence_leaves_the_record_unchanged() {
        let events = [
            request("1", "https://example.com/data.json", 1.0),
            response("1", "application/json", 1.1),
            finished("1", 12, 1.2),
        ];
        let body = ResponseBody {
            body: "{\"ok\":true}".to_owned(),
            is_binary: false,
        };

        let mut correlator = fold(&events);
        let first = correlator.attach_body("1", &body).unwrap();
        for event in &events {
            correlator.observe(event);
        }
        let second = correlator.attach_body("1", &body).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn transitions_are_independent_across_ids() {
        let correlator = fold(&[
            request("a", "https://example.com/a.css", 1.0),
            request("b", "https://example.com/b.js", 1.1),
            response("b", "text/javascript", 1.2),
            response("a", "text/css", 1.3),
        ]);
        assert_eq!(correlator.get("a").unwrap().content_type, ContentTypeTag::Css);
        assert_eq!(
            correlator.get("b").unwrap().content_type,
            ContentTypeTag::Javascript
        );
    }

    #[test]
    fn pure_transitions_do_not_need_a_correlator() {
        let created = apply_event(None, "tab-7", &finished("5", 1, 9.0));
        assert_eq!(created.session_id, "tab-7");
        let with_body = apply_body(
            &created,
            &ResponseBody {
                body: "AA==".to_owned(),
                is_binary: true,
            },
        );
        assert_eq!(with_body.body.as_deref(), Some("AA=="));
        assert_eq!(with_body.body_is_binary, Some(true));
        assert_eq!(with_body.encoded_body_size, Some(1));
    }

    #[test]
    fn seeded_records_absorb_later_stages() {
        let persisted = fold(&[
            request("1", "https://example.com/site.css", 1.0),
            response("1", "text/css", 1.1),
        ])
        .get("1")
        .unwrap()
        .clone();
        let mut foreign = persisted.clone();
        foreign.session_id = "tab-2".to_owned();
        foreign.exchange_id = "2".to_owned();

        let mut correlator = Correlator::new("tab-1");
        assert_eq!(correlator.seed([persisted, foreign]), 1);
        assert!(correlator.get("2").is_none());

        let done = correlator.observe(&finished("1", 10, 3.0));
        assert!(done.persist && done.fetch_body);
        assert_eq!(done.record.url, "https://example.com/site.css");
        assert_eq!(done.record.response_status, Some(200));
        assert_eq!(done.record.content_type, ContentTypeTag::Css);
        assert_eq!(done.record.encoded_body_size, Some(10));
        assert_eq!(done.record.observed_at, 1.0);

        let late = correlator.observe(&request("1", "https://example.com/other", 4.0));
        assert!(!late.persist);
        assert_eq!(late.record.url, "https://example.com/site.css");
    }

    #[test]
    fn bodies_for_untracked_exchanges_are_dropped() {
        let mut correlator = Correlator::new("tab-1");
        let body = ResponseBody {
            body: "x".to_owned(),
            is_binary: false,
        };
        assert!(correlator.attach_body("missing", &body).is_none());
        assert!(correlator.is_empty());
    }
}
