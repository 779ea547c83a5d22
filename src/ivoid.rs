//! IVOA identifier parsing.
//!
//! Identifiers have the shape `ivo://authority/resource#local-id`. The
//! grammar follows IVOA Identifiers 2.0; the authority must be at least three
//! characters and start with an alphanumeric.

use once_cell::sync::Lazy;
use regex::Regex;

static IVOID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^ivo://(?P<auth>[a-zA-Z0-9][\w\-.~*'()]{2,})/?(?P<rsrc>[\w\-.~*'()&+=/;?:@$,!%]*)#?(?P<local>[\w\-.~*'()&+=/;?:@$,!%]*)$",
    )
    .expect("IVOID pattern is valid")
});

/// Components of a parsed identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ivoid<'a> {
    pub authority: &'a str,
    pub resource: &'a str,
    pub local_id: &'a str,
}

impl<'a> Ivoid<'a> {
    /// Name of the event-store shard this identifier belongs to.
    pub fn shard_key(&self) -> String {
        format!("{}_{}", self.authority, self.resource).replace('/', "_")
    }
}

/// Split an identifier into authority, resource key and local ID.
///
/// Returns `None` if the text is not a valid IVOID. A missing resource key
/// or local ID is represented by an empty string.
pub fn parse_ivoid(text: &str) -> Option<Ivoid<'_>> {
    let caps = IVOID_RE.captures(text)?;
    Some(Ivoid {
        authority: caps.name("auth")?.as_str(),
        resource: caps.name("rsrc").map_or("", |m| m.as_str()),
        local_id: caps.name("local").map_or("", |m| m.as_str()),
    })
}
