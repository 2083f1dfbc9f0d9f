use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

use flint::shared::{ErrorType, WireError, WireResult};
use flint::Cid;

use crate::wire::Document;

/// A content-service-path names a view on the asset tree:
/// `/<path>?view=<name>&keyType=…&valueType=…&…`. Unknown query keys are
/// ignored; `view` is mandatory on first use of a path on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Csp {
    raw: String,
    path: String,
    view: ViewKind,
    key_type: Option<String>,
    value_type: Option<String>,
    put_returns_null: bool,
    remove_returns_null: bool,
    bootstrap: bool,
    base_path: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Map,
    KeySet,
    Values,
    EntrySet,
    Topic,
    Replication,
}

impl ViewKind {
    pub fn parse(name: &str) -> Option<ViewKind> {
        match name {
            "map" => Some(ViewKind::Map),
            "keySet" => Some(ViewKind::KeySet),
            "values" => Some(ViewKind::Values),
            "entrySet" => Some(ViewKind::EntrySet),
            "topic" => Some(ViewKind::Topic),
            "replication" => Some(ViewKind::Replication),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ViewKind::Map => "map",
            ViewKind::KeySet => "keySet",
            ViewKind::Values => "values",
            ViewKind::EntrySet => "entrySet",
            ViewKind::Topic => "topic",
            ViewKind::Replication => "replication",
        }
    }

    /// Collection views project the same asset map; they answer collection
    /// operations (`size`, `clear`, membership) against it.
    pub fn is_collection(self) -> bool {
        matches!(self, ViewKind::KeySet | ViewKind::Values | ViewKind::EntrySet)
    }
}

impl Csp {
    pub fn parse(raw: &str) -> WireResult<Csp> {
        if !raw.starts_with('/') {
            return Err(WireError::Fatal(ErrorType::ProtocolViolation));
        }

        let (path, query) = match raw.find('?') {
            Some(split) => (&raw[..split], &raw[split + 1..]),
            None => (raw, ""),
        };

        if path.len() > 1 && path.ends_with('/') {
            return Err(WireError::Fatal(ErrorType::ProtocolViolation));
        }

        let mut view = None;
        let mut key_type = None;
        let mut value_type = None;
        let mut put_returns_null = false;
        let mut remove_returns_null = false;
        let mut bootstrap = true;
        let mut base_path = None;

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = match pair.find('=') {
                Some(split) => (&pair[..split], &pair[split + 1..]),
                None => (pair, ""),
            };

            match key {
                "view" => {
                    view = Some(
                        ViewKind::parse(value)
                            .ok_or(WireError::Fatal(ErrorType::ProtocolViolation))?,
                    )
                }
                "keyType" => key_type = Some(value.to_string()),
                "valueType" => value_type = Some(value.to_string()),
                "putReturnsNull" => put_returns_null = parse_bool(value)?,
                "removeReturnsNull" => remove_returns_null = parse_bool(value)?,
                "bootstrap" => bootstrap = parse_bool(value)?,
                "basePath" => base_path = Some(value.to_string()),
                // Unknown query keys are ignored.
                _ => (),
            }
        }

        let view = view.ok_or(WireError::Fatal(ErrorType::ProtocolViolation))?;

        Ok(Csp {
            raw: raw.to_string(),
            path: path.to_string(),
            view,
            key_type,
            value_type,
            put_returns_null,
            remove_returns_null,
            bootstrap,
            base_path,
        })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn view(&self) -> ViewKind {
        self.view
    }

    #[inline]
    pub fn put_returns_null(&self) -> bool {
        self.put_returns_null
    }

    #[inline]
    pub fn remove_returns_null(&self) -> bool {
        self.remove_returns_null
    }

    #[inline]
    pub fn bootstrap(&self) -> bool {
        self.bootstrap
    }

    #[inline]
    pub fn key_type(&self) -> Option<&str> {
        self.key_type.as_deref()
    }

    #[inline]
    pub fn value_type(&self) -> Option<&str> {
        self.value_type.as_deref()
    }

    #[inline]
    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    /// Same asset, different view. Used to mint set-proxy paths.
    pub fn derived(&self, view: ViewKind) -> Csp {
        let mut derived = self.clone();
        derived.view = view;
        derived.raw = format!("{}?view={}", self.path, view.name());
        derived
    }
}

impl fmt::Display for Csp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn parse_bool(value: &str) -> WireResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(WireError::Fatal(ErrorType::ProtocolViolation)),
    }
}

/// Per-connection CSP ↔ CID aliasing. The first time a path appears on a
/// connection it is assigned a fresh 64-bit alias; from then on requests may
/// carry either form in the meta document.
pub struct CidBinder {
    by_cid: HashMap<Cid, Arc<Csp>>,
    by_raw: HashMap<String, Cid>,
    next: Cid,
}

impl CidBinder {
    #[inline]
    pub fn new() -> CidBinder {
        CidBinder {
            by_cid: HashMap::new(),
            by_raw: HashMap::new(),
            next: 1,
        }
    }

    /// Binds (or re-finds) the alias for a parsed path.
    pub fn bind(&mut self, csp: Arc<Csp>) -> Cid {
        if let Some(&cid) = self.by_raw.get(csp.as_str()) {
            return cid;
        }

        let cid = self.next;
        self.next += 1;
        self.by_raw.insert(csp.as_str().to_string(), cid);
        self.by_cid.insert(cid, csp);
        cid
    }

    #[inline]
    pub fn lookup(&self, cid: Cid) -> Option<Arc<Csp>> {
        self.by_cid.get(&cid).cloned()
    }

    /// Resolves the view a meta document addresses, binding a fresh alias
    /// when a new path appears. A meta document without `csp` or `cid` (or
    /// with an unknown cid) is a protocol violation.
    pub fn resolve(&mut self, meta: &Document) -> WireResult<(Arc<Csp>, Cid)> {
        if let Some(raw) = meta.text_field("csp") {
            let csp = Arc::new(Csp::parse(raw)?);
            let cid = self.bind(csp.clone());
            return Ok((self.by_cid[&cid].clone(), cid));
        }

        if let Some(cid) = meta.i64_field("cid") {
            let cid = cid as Cid;
            return self
                .lookup(cid)
                .map(|csp| (csp, cid))
                .ok_or(WireError::Fatal(ErrorType::ProtocolViolation));
        }

        Err(WireError::Fatal(ErrorType::ProtocolViolation))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.by_cid.clear();
        self.by_raw.clear();
        self.next = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Value;

    #[test]
    fn test_parse_full_grammar() {
        let csp = Csp::parse(
            "/market/orders?view=map&keyType=java.lang.String&valueType=net.Order\
             &putReturnsNull=true&removeReturnsNull=false&bootstrap=false&basePath=/market",
        )
        .unwrap();

        assert_eq!(csp.path(), "/market/orders");
        assert_eq!(csp.view(), ViewKind::Map);
        assert_eq!(csp.key_type(), Some("java.lang.String"));
        assert_eq!(csp.value_type(), Some("net.Order"));
        assert!(csp.put_returns_null());
        assert!(!csp.remove_returns_null());
        assert!(!csp.bootstrap());
        assert_eq!(csp.base_path(), Some("/market"));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let csp = Csp::parse("/a?view=map&shinyNewOption=7&other").unwrap();
        assert_eq!(csp.view(), ViewKind::Map);
    }

    #[test]
    fn test_view_mandatory() {
        assert_eq!(
            Csp::parse("/a?keyType=x"),
            Err(WireError::Fatal(ErrorType::ProtocolViolation))
        );
    }

    #[test]
    fn test_malformed_paths_rejected() {
        assert!(Csp::parse("relative?view=map").is_err());
        assert!(Csp::parse("/a/?view=map").is_err());
        assert!(Csp::parse("/a?view=spreadsheet").is_err());
    }

    #[test]
    fn test_derived_view() {
        let csp = Csp::parse("/m?view=map&putReturnsNull=true").unwrap();
        let keys = csp.derived(ViewKind::KeySet);

        assert_eq!(keys.as_str(), "/m?view=keySet");
        assert_eq!(keys.path(), "/m");
        assert_eq!(keys.view(), ViewKind::KeySet);
        // Flags carry over from the parent view.
        assert!(keys.put_returns_null());
    }

    #[test]
    fn test_binder_roundtrip() {
        let mut binder = CidBinder::new();
        let csp = Arc::new(Csp::parse("/m?view=map").unwrap());

        let cid = binder.bind(csp.clone());
        assert_eq!(binder.bind(csp.clone()), cid);
        assert_eq!(binder.lookup(cid).unwrap().as_str(), "/m?view=map");

        let other = Arc::new(Csp::parse("/n?view=map").unwrap());
        assert_ne!(binder.bind(other), cid);
    }

    #[test]
    fn test_resolve_csp_then_cid() {
        let mut binder = CidBinder::new();

        let meta = Document::new().with("csp", Value::Text("/m?view=map".to_string()));
        let (by_path, cid) = binder.resolve(&meta).unwrap();

        let meta = Document::new().with("cid", Value::I64(cid as i64));
        let (by_cid, cid_again) = binder.resolve(&meta).unwrap();

        assert_eq!(by_path, by_cid);
        assert_eq!(cid, cid_again);
    }

    #[test]
    fn test_resolve_unknown_cid_rejected() {
        let mut binder = CidBinder::new();
        let meta = Document::new().with("cid", Value::I64(99));

        assert_eq!(
            binder.resolve(&meta).err().unwrap(),
            WireError::Fatal(ErrorType::ProtocolViolation)
        );
    }
}
