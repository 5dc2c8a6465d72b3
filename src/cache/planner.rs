//! Invalidation plan generation.
//!
//! Merges a batch of cache events into the set of actions the consumer runs.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use tracing::warn;
use uuid::Uuid;

use super::events::{CacheEvent, InvalidationSignal};
use super::translate::EventPathTranslator;

/// Actions to execute for one batch of events.
#[derive(Debug)]
pub struct InvalidationPlan<E> {
    /// Ids of the events merged into this plan, deduplicated, in queue order.
    pub event_ids: Vec<Uuid>,
    /// Event ids to hand to object caches, deduplicated, first occurrence first.
    pub events: Vec<E>,
    /// Whether output caches must be flushed.
    pub flush_output: bool,
    /// Path changes no translator could map to an event id.
    pub untranslated: usize,
}

impl<E> Default for InvalidationPlan<E> {
    fn default() -> Self {
        Self {
            event_ids: Vec::new(),
            events: Vec::new(),
            flush_output: false,
            untranslated: 0,
        }
    }
}

impl<E> fmt::Display for InvalidationPlan<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ merged: {}, events: {}, flush_output: {}, untranslated: {} }}",
            self.event_ids.len(),
            self.events.len(),
            self.flush_output,
            self.untranslated,
        )
    }
}

impl<E> InvalidationPlan<E>
where
    E: Hash + Eq + Clone,
{
    /// Merge a batch of events into a plan.
    ///
    /// - Deduplicates by event ID
    /// - Translates path changes through `translator`, when given
    /// - Any content change, container refresh or explicit flush flags an
    ///   output flush
    pub fn from_events(
        events: Vec<CacheEvent<E>>,
        translator: Option<&dyn EventPathTranslator<E>>,
    ) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut seen_events = HashSet::new();

        for event in events {
            if !seen_ids.insert(event.id) {
                continue;
            }
            plan.event_ids.push(event.id);

            let translated = match event.signal {
                InvalidationSignal::Event(id) => Some(id),
                InvalidationSignal::PathChanged(path) => match translator {
                    Some(translator) => match translator.translate(&path) {
                        Ok(id) => Some(id),
                        Err(err) => {
                            warn!(path = %path, error = %err, "Could not translate changed path");
                            plan.untranslated += 1;
                            None
                        }
                    },
                    None => {
                        plan.untranslated += 1;
                        None
                    }
                },
                InvalidationSignal::ContainerRefreshed | InvalidationSignal::FlushAll => None,
            };

            // Every signal is a change to something rendered output may depend on.
            plan.flush_output = true;

            if let Some(id) = translated
                && seen_events.insert(id.clone())
            {
                plan.events.push(id);
            }
        }

        plan
    }

    /// Check if the plan has any actions to execute.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && !self.flush_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::translate::RootPathTranslator;

    fn make_event(signal: InvalidationSignal<String>, epoch: u64) -> CacheEvent<String> {
        CacheEvent::new(signal, epoch)
    }

    #[test]
    fn event_signal_is_forwarded_and_flushes_output() {
        let events = vec![make_event(InvalidationSignal::Event("news".to_string()), 0)];
        let plan = InvalidationPlan::from_events(events, None);

        assert_eq!(plan.events, vec!["news".to_string()]);
        assert!(plan.flush_output);
        assert_eq!(plan.event_ids.len(), 1);
    }

    #[test]
    fn container_refresh_flushes_output_only() {
        let events = vec![make_event(InvalidationSignal::ContainerRefreshed, 0)];
        let plan = InvalidationPlan::from_events(events, None);

        assert!(plan.events.is_empty());
        assert!(plan.flush_output);
    }

    #[test]
    fn path_change_is_translated() {
        let translator = RootPathTranslator::new("/hst:hst/hst:configurations");
        let events = vec![make_event(
            InvalidationSignal::PathChanged("/hst:hst/hst:configurations/foo/bar".to_string()),
            0,
        )];
        let plan = InvalidationPlan::from_events(events, Some(&translator));

        assert_eq!(plan.events, vec!["/hst:hst/hst:configurations/foo".to_string()]);
        assert_eq!(plan.untranslated, 0);
    }

    #[test]
    fn untranslatable_path_still_flushes_output() {
        let translator = RootPathTranslator::new("/hst:hst/hst:configurations");
        let events = vec![
            make_event(InvalidationSignal::PathChanged("/content/a".to_string()), 0),
            make_event(InvalidationSignal::PathChanged("/content/b".to_string()), 1),
        ];
        let plan = InvalidationPlan::from_events(events, Some(&translator));

        assert!(plan.events.is_empty());
        assert_eq!(plan.untranslated, 2);
        assert!(plan.flush_output);
    }

    #[test]
    fn dedupe_by_event_id() {
        let event = make_event(InvalidationSignal::Event("news".to_string()), 0);

        // Same event twice
        let plan = InvalidationPlan::from_events(vec![event.clone(), event], None);

        assert_eq!(plan.event_ids.len(), 1);
        assert_eq!(plan.events.len(), 1);
    }

    #[test]
    fn repeated_event_values_are_merged() {
        let events = vec![
            make_event(InvalidationSignal::Event("a".to_string()), 0),
            make_event(InvalidationSignal::Event("b".to_string()), 1),
            make_event(InvalidationSignal::Event("a".to_string()), 2),
        ];
        let plan = InvalidationPlan::from_events(events, None);

        assert_eq!(plan.event_ids.len(), 3);
        assert_eq!(plan.events, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn display_format() {
        let plan: InvalidationPlan<String> = InvalidationPlan::default();
        let display = format!("{}", plan);
        assert!(display.contains("InvalidationPlan"));
        assert!(display.contains("events: 0"));
    }

    #[test]
    fn is_empty() {
        let plan: InvalidationPlan<String> = InvalidationPlan::default();
        assert!(plan.is_empty());

        let events = vec![make_event(InvalidationSignal::FlushAll, 0)];
        let plan = InvalidationPlan::from_events(events, None);
        assert!(!plan.is_empty());
    }
}
