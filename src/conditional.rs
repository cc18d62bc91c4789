//! `If` header parsing and evaluation (spec.md §4.D).
//!
//! Grammar (RFC 4918 §10.4.2, restated):
//!
//! ```text
//! If = "If" ":" ( 1*No-tag-list | 1*Tagged-list )
//! No-tag-list = List
//! Tagged-list = Resource-Tag 1*List
//! List = "(" 1*Condition ")"
//! Condition = ["Not"] (State-token | "[" entity-tag "]")
//! State-token = Coded-URL
//! ```
//!
//! A `List` is an AND of its conditions; a header is an OR of its lists.

use crate::lock::PathInfo;
use crate::webpath::LockPath;

/// One condition inside a `List`: either a lock token or an entity-tag,
/// optionally negated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfCondition {
    StateToken { token: String, negated: bool },
    EntityTag { etag: String, negated: bool },
}

impl IfCondition {
    fn matches(&self, info: &PathInfo) -> bool {
        match self {
            IfCondition::StateToken { token, negated } => {
                let present = info.tokens.contains_key(token);
                present != *negated
            },
            IfCondition::EntityTag { etag, negated } => {
                let present = info.entity_tag.as_deref() == Some(etag.as_str());
                present != *negated
            },
        }
    }
}

/// An AND-ed group of conditions, optionally tagged to a specific resource.
#[derive(Debug, Clone)]
pub struct IfList {
    /// `None` for a `No-tag-list`; `Some(path)` for a `Tagged-list`.
    pub resource_tag: Option<LockPath>,
    pub conditions: Vec<IfCondition>,
}

impl IfList {
    /// A list is satisfied when every condition in it matches the state of
    /// the resource it applies to.
    pub(crate) fn matches(&self, info: &PathInfo) -> bool {
        self.conditions.iter().all(|c| c.matches(info))
    }

    /// At least one non-negated token condition — a list made only of
    /// negated tokens, or of entity-tag conditions, does not require one
    /// (spec.md §4.D, §8 boundary behaviors).
    pub fn requires_state_token(&self) -> bool {
        self.conditions.iter().any(|c| matches!(c, IfCondition::StateToken { negated: false, .. }))
    }

    pub fn requires_entity_tag(&self) -> bool {
        self.conditions.iter().any(|c| matches!(c, IfCondition::EntityTag { .. }))
    }
}

/// A fully parsed `If` header: an OR of `IfList`s.
#[derive(Debug, Clone)]
pub struct IfHeader {
    pub lists: Vec<IfList>,
}

#[derive(Debug)]
pub enum IfParseError {
    UnexpectedEnd,
    UnexpectedToken(String),
    EmptyList,
}

impl std::fmt::Display for IfParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for IfParseError {}

/// Tokenizes the `If` header grammar. `Resource-Tag = "<" Simple-ref ">"`
/// and a condition's state token are both written as a bracketed
/// `<...>`, so telling them apart requires position, not shape: a
/// bracketed value is only ever a `Resource-Tag` outside a `List`
/// (mirroring the teacher's `IfState` distinction between "expecting a
/// tag" and "inside a list" in its own conditional-header parser).
struct Tokenizer<'a> {
    rest: &'a str,
    in_list: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Tok {
    LParen,
    RParen,
    Not,
    StateToken(String),
    EntityTag(String),
    ResourceTag(String),
}

impl<'a> Tokenizer<'a> {
    fn new(s: &'a str) -> Tokenizer<'a> {
        Tokenizer { rest: s, in_list: false }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn next(&mut self) -> Result<Option<Tok>, IfParseError> {
        self.skip_ws();
        if self.rest.is_empty() {
            return Ok(None);
        }
        if let Some(r) = self.rest.strip_prefix('(') {
            self.rest = r;
            self.in_list = true;
            return Ok(Some(Tok::LParen));
        }
        if let Some(r) = self.rest.strip_prefix(')') {
            self.rest = r;
            self.in_list = false;
            return Ok(Some(Tok::RParen));
        }
        if !self.in_list {
            // Between lists, only a bracketed Resource-Tag is valid.
            if let Some(r) = self.rest.strip_prefix('<') {
                let end = r.find('>').ok_or(IfParseError::UnexpectedEnd)?;
                let tag = r[..end].to_string();
                self.rest = &r[end + 1..];
                return Ok(Some(Tok::ResourceTag(tag)));
            }
            return Err(IfParseError::UnexpectedToken(self.rest.to_string()));
        }
        if let Some(r) = self.rest.strip_prefix("Not") {
            if r.is_empty() || !r.as_bytes()[0].is_ascii_alphanumeric() {
                self.rest = r;
                return Ok(Some(Tok::Not));
            }
        }
        if let Some(r) = self.rest.strip_prefix('<') {
            let end = r.find('>').ok_or(IfParseError::UnexpectedEnd)?;
            let token = r[..end].to_string();
            self.rest = &r[end + 1..];
            return Ok(Some(Tok::StateToken(token)));
        }
        if let Some(r) = self.rest.strip_prefix('[') {
            let end = r.find(']').ok_or(IfParseError::UnexpectedEnd)?;
            let etag = r[..end].trim().to_string();
            self.rest = &r[end + 1..];
            return Ok(Some(Tok::EntityTag(etag)));
        }
        Err(IfParseError::UnexpectedToken(self.rest.to_string()))
    }
}

impl IfHeader {
    /// Parse a raw `If` header value.
    pub fn parse(raw: &str) -> Result<IfHeader, IfParseError> {
        let mut tz = Tokenizer::new(raw);
        let mut lists = Vec::new();
        let mut pending_tag: Option<String> = None;
        loop {
            match tz.next()? {
                None => break,
                Some(Tok::ResourceTag(tag)) => {
                    pending_tag = Some(tag);
                },
                Some(Tok::LParen) => {
                    let resource_tag = match &pending_tag {
                        Some(t) => Some(LockPath::parse(t).map_err(|_| IfParseError::UnexpectedToken(t.clone()))?),
                        None => None,
                    };
                    let mut conditions = Vec::new();
                    let mut negate_next = false;
                    loop {
                        match tz.next()? {
                            Some(Tok::RParen) => break,
                            Some(Tok::Not) => negate_next = true,
                            Some(Tok::StateToken(token)) => {
                                conditions.push(IfCondition::StateToken { token, negated: negate_next });
                                negate_next = false;
                            },
                            Some(Tok::EntityTag(etag)) => {
                                conditions.push(IfCondition::EntityTag { etag, negated: negate_next });
                                negate_next = false;
                            },
                            Some(other) => return Err(IfParseError::UnexpectedToken(format!("{:?}", other))),
                            None => return Err(IfParseError::UnexpectedEnd),
                        }
                    }
                    if conditions.is_empty() {
                        return Err(IfParseError::EmptyList);
                    }
                    lists.push(IfList { resource_tag, conditions });
                },
                Some(other) => return Err(IfParseError::UnexpectedToken(format!("{:?}", other))),
            }
        }
        if lists.is_empty() {
            return Err(IfParseError::UnexpectedEnd);
        }
        Ok(IfHeader { lists })
    }

    /// Whether the header is satisfied for the given request path, resolving
    /// each tagged list against `resolve`'s view of that resource's locks and
    /// entity-tag, and untagged lists against `default_path`'s.
    ///
    /// An `If` header as a whole matches when at least one `IfList` matches
    /// (OR across lists); a list matches when every condition in it matches
    /// (AND within a list).
    pub fn evaluate<'a, F>(&self, default_path: &LockPath, resolve: F) -> bool
    where
        F: Fn(&LockPath) -> &'a PathInfo,
    {
        self.lists.iter().any(|list| {
            let path = list.resource_tag.as_ref().unwrap_or(default_path);
            list.matches(resolve(path))
        })
    }

    /// True if any list in the header requires a state token — used by
    /// `UNLOCK`/refresh dispatch, which reject headers that could only be
    /// satisfied by entity tags.
    pub fn requires_state_token(&self) -> bool {
        self.lists.iter().any(IfList::requires_state_token)
    }

    pub fn requires_entity_tag(&self) -> bool {
        self.lists.iter().any(IfList::requires_entity_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn info_with_token(token: &str) -> PathInfo {
        let mut tokens = HashMap::new();
        tokens.insert(token.to_string(), test_lock(token));
        PathInfo { locks: vec![], tokens, entity_tag: None }
    }

    fn test_lock(token: &str) -> crate::lock::ActiveLock {
        crate::lock::ActiveLock::new(
            LockPath::parse("/a").unwrap(),
            "/a".to_string(),
            false,
            None,
            crate::lock::LockAccessType::Write,
            crate::lock::LockShareMode::Exclusive,
            std::time::Duration::from_secs(60),
            token.to_string(),
            chrono::Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn parses_single_untagged_token_list() {
        let h = IfHeader::parse("(<opaquelocktoken:abc>)").unwrap();
        assert_eq!(h.lists.len(), 1);
        assert!(h.lists[0].resource_tag.is_none());
        assert_eq!(h.lists[0].conditions.len(), 1);
    }

    #[test]
    fn parses_tagged_list_with_resource() {
        let h = IfHeader::parse("</a/b> (<opaquelocktoken:abc>)").unwrap();
        assert_eq!(h.lists[0].resource_tag.as_ref().unwrap().as_str(), "/a/b");
        assert_eq!(h.lists[0].conditions.len(), 1);
    }

    #[test]
    fn one_resource_tag_applies_to_every_following_list() {
        let h = IfHeader::parse("</a/b> (<opaquelocktoken:abc>) (<opaquelocktoken:def>)").unwrap();
        assert_eq!(h.lists.len(), 2);
        assert_eq!(h.lists[0].resource_tag.as_ref().unwrap().as_str(), "/a/b");
        assert_eq!(h.lists[1].resource_tag.as_ref().unwrap().as_str(), "/a/b");
    }

    #[test]
    fn a_second_tagged_section_switches_the_resource_tag() {
        let h = IfHeader::parse("</a/> (<opaquelocktoken:abc>) </b/> (<opaquelocktoken:def>)").unwrap();
        assert_eq!(h.lists[0].resource_tag.as_ref().unwrap().as_str(), "/a/");
        assert_eq!(h.lists[1].resource_tag.as_ref().unwrap().as_str(), "/b/");
    }

    #[test]
    fn negation_inverts_match() {
        let h = IfHeader::parse("(Not <opaquelocktoken:abc>)").unwrap();
        let path = LockPath::parse("/a").unwrap();
        let present = info_with_token("opaquelocktoken:abc");
        assert!(!h.evaluate(&path, |_| &present));
        let absent = PathInfo::default();
        assert!(h.evaluate(&path, |_| &absent));
    }

    #[test]
    fn or_across_lists_any_list_matching_suffices() {
        let h = IfHeader::parse("(<opaquelocktoken:abc>) (<opaquelocktoken:def>)").unwrap();
        let path = LockPath::parse("/a").unwrap();
        let has_def = info_with_token("opaquelocktoken:def");
        assert!(h.evaluate(&path, |_| &has_def));
    }

    #[test]
    fn and_within_list_requires_every_condition() {
        let h = IfHeader::parse("(<opaquelocktoken:abc> [\"etag1\"])").unwrap();
        let path = LockPath::parse("/a").unwrap();
        let mut info = info_with_token("opaquelocktoken:abc");
        info.entity_tag = Some("\"etag2\"".to_string());
        assert!(!h.evaluate(&path, |_| &info));
        info.entity_tag = Some("\"etag1\"".to_string());
        assert!(h.evaluate(&path, |_| &info));
    }

    #[test]
    fn rejects_empty_list() {
        assert!(IfHeader::parse("()").is_err());
    }
}
