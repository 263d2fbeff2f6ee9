//! Event model (C4): tagged-union payloads, each with an
//! identity key (used for commit-time dedup, "last write wins") and a set
//! of SSE topics.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    Coloring,
    Svg,
}

impl std::fmt::Display for StatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusType::Coloring => write!(f, "coloring"),
            StatusType::Svg => write!(f, "svg"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderUpdate {
        order_id: i64,
    },
    /// Batch aggregate; `collect_events = {OrderUpdate}`. Carries no
    /// payload beyond its discriminator; the UI just refetches the list.
    ListUpdate,
    ImageUpdate {
        order_id: i64,
        image_id: i64,
    },
    ImageStatus {
        order_id: i64,
        image_id: i64,
        status_type: StatusType,
        version_id: i64,
        status: String,
    },
}

impl Event {
    /// Commit-time dedup key: at most one of these survives per commit.
    pub fn identity_key(&self) -> String {
        match self {
            Event::OrderUpdate { order_id } => format!("order:{order_id}"),
            Event::ListUpdate => "list".to_string(),
            Event::ImageUpdate { image_id, .. } => format!("image:{image_id}"),
            Event::ImageStatus { version_id, status_type, .. } => {
                format!("img-status:{version_id}:{status_type}")
            }
        }
    }

    pub fn topics(&self) -> Vec<String> {
        match self {
            Event::OrderUpdate { order_id } => vec!["orders".to_string(), format!("orders/{order_id}")],
            Event::ListUpdate => vec!["orders".to_string()],
            Event::ImageUpdate { order_id, .. } => {
                vec!["orders".to_string(), format!("orders/{order_id}")]
            }
            Event::ImageStatus { order_id, .. } => vec![format!("orders/{order_id}")],
        }
    }

    /// `true` for event kinds ListUpdate declares as `collect_events`; these
    /// never publish on their own inside a deferred-batch scope.
    pub fn is_collected_by_list_update(&self) -> bool {
        matches!(self, Event::OrderUpdate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_distinguish_records() {
        assert_ne!(
            Event::OrderUpdate { order_id: 1 }.identity_key(),
            Event::OrderUpdate { order_id: 2 }.identity_key()
        );
    }

    #[test]
    fn order_update_is_collected_image_update_is_not() {
        assert!(Event::OrderUpdate { order_id: 1 }.is_collected_by_list_update());
        assert!(!Event::ImageUpdate { order_id: 1, image_id: 2 }.is_collected_by_list_update());
    }

    #[test]
    fn serializes_with_snake_case_type_tag() {
        let json = serde_json::to_value(Event::ImageStatus {
            order_id: 1,
            image_id: 2,
            status_type: StatusType::Svg,
            version_id: 3,
            status: "error".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "image_status");
        assert_eq!(json["status_type"], "svg");
    }
}
