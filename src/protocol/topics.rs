//! Topic name and topic filter validation
//!
//! Topic names (used by PUBLISH) never contain wildcards. Topic filters (used
//! by SUBSCRIBE/UNSUBSCRIBE) may use `+` as a whole level and `#` as the whole
//! last level.

use thiserror::Error;

/// Longest topic the wire format can carry
pub const MAX_TOPIC_LEN: usize = 65_535;

pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TopicError::InvalidMultiLevelWildcard(filter.to_string()));
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::InvalidSingleLevelWildcard(filter.to_string()));
        }
    }
    Ok(())
}

/// True when `topic` is matched by `filter`. Both must already be valid.
///
/// Topics starting with `$` are not matched by filters starting with a wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic of {0} bytes exceeds 65535 bytes")]
    TooLong(usize),
    #[error("Topic contains U+0000")]
    NullCharacter,
    #[error("Topic name '{0}' contains a wildcard")]
    WildcardInTopicName(String),
    #[error("'#' must be the entire last level in '{0}'")]
    InvalidMultiLevelWildcard(String),
    #[error("'+' must occupy an entire level in '{0}'")]
    InvalidSingleLevelWildcard(String),
}
