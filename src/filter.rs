use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// A single REQ filter (NIP-01). A REQ carries one or more of these,
/// joined disjunctively.
///
/// `ids` and `authors` entries may be full 64-char hex strings or prefixes.
/// Tag filters arrive as `#<letter>` keys and are matched against the second
/// element of same-named event tags. Unrecognized keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(
        flatten,
        serialize_with = "serialize_tags",
        deserialize_with = "deserialize_tags"
    )]
    pub tags: BTreeMap<char, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Default::default()
    }

    fn ids_match(&self, event: &Event) -> bool {
        self.ids
            .as_ref()
            .map_or(true, |ids| ids.iter().any(|p| event.id.starts_with(p.as_str())))
    }

    fn authors_match(&self, event: &Event) -> bool {
        self.authors.as_ref().map_or(true, |authors| {
            authors.iter().any(|p| event.pubkey.starts_with(p.as_str()))
        })
    }

    fn kinds_match(&self, event: &Event) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&event.kind))
    }

    fn tags_match(&self, event: &Event) -> bool {
        self.tags.iter().all(|(letter, values)| {
            let name = letter.to_string();
            let matched = event
                .tag_values(&name)
                .any(|v| values.iter().any(|want| want == v));
            matched
        })
    }

    /// In-memory match used for live broadcast and post-filtering of store
    /// results. Every present key must match.
    pub fn match_event(&self, event: &Event) -> bool {
        self.ids_match(event)
            && self.authors_match(event)
            && self.kinds_match(event)
            && self.since.map_or(true, |t| event.created_at >= t)
            && self.until.map_or(true, |t| event.created_at <= t)
            && self.tags_match(event)
    }
}

/// Disjunction over a REQ's filter set.
pub fn match_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.match_event(event))
}

fn serialize_tags<S>(tags: &BTreeMap<char, Vec<String>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(tags.len()))?;
    for (letter, values) in tags.iter() {
        map.serialize_entry(&format!("#{letter}"), values)?;
    }
    map.end()
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<BTreeMap<char, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TagsVisitor;

    impl<'de> Visitor<'de> for TagsVisitor {
        type Value = BTreeMap<char, Vec<String>>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("map with keys in \"#x\" format")
        }

        fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut tags: BTreeMap<char, Vec<String>> = BTreeMap::new();
            while let Some(key) = map.next_key::<String>()? {
                let mut chars = key.chars();
                if let (Some('#'), Some(letter), None) = (chars.next(), chars.next(), chars.next())
                {
                    tags.insert(letter, map.next_value()?);
                } else {
                    // Unrecognized filter key: consume and ignore.
                    let _: serde::de::IgnoredAny = map.next_value()?;
                }
            }
            Ok(tags)
        }
    }

    deserializer.deserialize_map(TagsVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, pubkey: &str, created_at: i64, kind: u32, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: id.repeat(64),
            pubkey: pubkey.repeat(64),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn parse_and_serialize() {
        let json = r##"{"ids":["ab"],"kinds":[1,0],"#e":["cafe"],"#t":["nostr"],"since":10,"limit":5}"##;
        let filter: Filter = serde_json::from_str(json).unwrap();
        assert_eq!(filter.ids, Some(vec!["ab".to_string()]));
        assert_eq!(filter.kinds, Some(vec![1, 0]));
        assert_eq!(filter.tags.get(&'e'), Some(&vec!["cafe".to_string()]));
        assert_eq!(filter.tags.get(&'t'), Some(&vec!["nostr".to_string()]));
        assert_eq!(filter.since, Some(10));
        assert_eq!(filter.limit, Some(5));

        let round: Filter = serde_json::from_str(&serde_json::to_string(&filter).unwrap()).unwrap();
        assert_eq!(round, filter);
    }

    #[test]
    fn unknown_keys_ignored() {
        let filter: Filter =
            serde_json::from_str(r#"{"kinds":[1],"search":"x","bogus":{"a":1}}"#).unwrap();
        assert_eq!(filter.kinds, Some(vec![1]));
        assert!(filter.tags.is_empty());
    }

    #[test]
    fn scalar_matching() {
        let event = note("a", "b", 100, 1, vec![]);

        assert!(Filter::new().match_event(&event));
        assert!(Filter { kinds: Some(vec![1]), ..Default::default() }.match_event(&event));
        assert!(!Filter { kinds: Some(vec![2]), ..Default::default() }.match_event(&event));

        // since/until are inclusive.
        let since_eq = Filter { since: Some(100), ..Default::default() };
        let until_eq = Filter { until: Some(100), ..Default::default() };
        assert!(since_eq.match_event(&event));
        assert!(until_eq.match_event(&event));
        assert!(!Filter { since: Some(101), ..Default::default() }.match_event(&event));
        assert!(!Filter { until: Some(99), ..Default::default() }.match_event(&event));
    }

    #[test]
    fn prefix_matching() {
        let event = note("a", "b", 100, 1, vec![]);
        let by_prefix = Filter {
            ids: Some(vec!["aaaa".to_string()]),
            authors: Some(vec!["bb".to_string()]),
            ..Default::default()
        };
        assert!(by_prefix.match_event(&event));

        let wrong = Filter { ids: Some(vec!["ab".to_string()]), ..Default::default() };
        assert!(!wrong.match_event(&event));
    }

    #[test]
    fn tag_matching() {
        let event = note(
            "a",
            "b",
            100,
            1,
            vec![
                vec!["e".to_string(), "cafe".to_string()],
                vec!["t".to_string(), "nostr".to_string()],
            ],
        );

        let mut filter = Filter::new();
        filter.tags.insert('t', vec!["nostr".to_string()]);
        assert!(filter.match_event(&event));

        // Every tag key must be satisfied.
        filter.tags.insert('p', vec!["deadbeef".to_string()]);
        assert!(!filter.match_event(&event));

        let mut wrong_value = Filter::new();
        wrong_value.tags.insert('t', vec!["bitcoin".to_string()]);
        assert!(!wrong_value.match_event(&event));
    }

    #[test]
    fn disjunction_across_filters() {
        let event = note("a", "b", 100, 1, vec![]);
        let miss = Filter { kinds: Some(vec![2]), ..Default::default() };
        let hit = Filter { kinds: Some(vec![1]), ..Default::default() };
        assert!(match_any(&[miss.clone(), hit], &event));
        assert!(!match_any(&[miss], &event));
    }
}
