/**
 * Watch queries, canonical subscription identity, and endpoint builders
 */
use super::config::WATCH_TIMEOUT_SECONDS;
use super::errors::WatchError;
use super::kinds::{KindRef, ResourceKind};
use hyper::http;
use itertools::Itertools;
use kube::api::{GetParams, ListParams, WatchParams};
use kube::core::Request;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Order-independent selector: a set of normalized requirements
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Selector(BTreeSet<String>);

impl Selector {
    /// Parse a selector string such as `app=web, tier in (b, a)`.
    ///
    /// Requirements are split on top-level commas, whitespace is normalized,
    /// `==` collapses to `=`, and set values are sorted, so equivalent
    /// selectors written differently compare equal.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut requirements = BTreeSet::new();
        let mut depth = 0usize;
        let mut current = String::new();
        for ch in raw.chars() {
            match ch {
                '(' => {
                    depth += 1;
                    current.push(ch);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(ch);
                }
                ',' if depth == 0 => {
                    if let Some(req) = normalize_requirement(&current) {
                        requirements.insert(req);
                    }
                    current.clear();
                }
                _ => current.push(ch),
            }
        }
        if let Some(req) = normalize_requirement(&current) {
            requirements.insert(req);
        }
        Self(requirements)
    }

    #[must_use]
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self(labels.iter().map(|(k, v)| format!("{k}={v}")).collect())
    }

    #[must_use]
    pub fn with(mut self, requirement: &str) -> Self {
        if let Some(req) = normalize_requirement(requirement) {
            self.0.insert(req);
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire form, `None` when empty
    #[must_use]
    pub fn to_query(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.iter().join(","))
        }
    }
}

fn normalize_requirement(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let set = match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => Some((open, close)),
        _ => None,
    };
    if let Some((open, close)) = set {
        let head = trimmed[..open].split_whitespace().join(" ");
        let values = trimmed[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .sorted()
            .join(",");
        return Some(format!("{head} ({values})"));
    }
    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    Some(compact.replace("==", "="))
}

/// What a consumer asks to watch
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WatchQuery {
    pub namespace: Option<String>,
    pub label_selector: Selector,
    pub field_selector: Selector,
    pub name: Option<String>,
    pub limit: Option<u32>,
    pub cluster: Option<String>,
}

impl WatchQuery {
    /// Watch a whole collection
    #[must_use]
    pub fn list() -> Self {
        Self::default()
    }

    /// Watch a single named object
    #[must_use]
    pub fn object(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Selector::parse(selector);
        self
    }

    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Selector::parse(selector);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    #[must_use]
    pub const fn is_object(&self) -> bool {
        self.name.is_some()
    }

    fn list_params(&self, page_size: u32, continue_token: Option<&str>) -> ListParams {
        let mut lp = ListParams::default().limit(self.limit.unwrap_or(page_size));
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }
        if let Some(labels) = self.label_selector.to_query() {
            lp = lp.labels(&labels);
        }
        if let Some(fields) = self.field_selector.to_query() {
            lp = lp.fields(&fields);
        }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        if let Some(labels) = self.label_selector.to_query() {
            wp = wp.labels(&labels);
        }
        let mut fields = self.field_selector.clone();
        if let Some(name) = &self.name {
            fields = fields.with(&format!("metadata.name={name}"));
        }
        if let Some(fields) = fields.to_query() {
            wp = wp.fields(&fields);
        }
        wp
    }
}

/// Canonical identity of one logical watch.
///
/// Derived from cluster, kind and the normalized query, so semantically
/// identical queries from different call sites collapse to one id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId {
    key: String,
    object: bool,
}

impl SubscriptionId {
    #[must_use]
    pub fn new(kind: &KindRef, query: &WatchQuery) -> Self {
        let kind = kind.to_string();
        let labels = query.label_selector.to_query().unwrap_or_default();
        let fields = query.field_selector.to_query().unwrap_or_default();
        let limit = query.limit.map(|l| l.to_string()).unwrap_or_default();
        let parts: [&str; 8] = [
            query.cluster.as_deref().unwrap_or("local"),
            if query.is_object() { "object" } else { "list" },
            &kind,
            query.namespace.as_deref().unwrap_or("*"),
            query.name.as_deref().unwrap_or("*"),
            &labels,
            &fields,
            &limit,
        ];
        Self {
            key: parts.join("|"),
            object: query.is_object(),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Whether this identifies a single-object watch
    #[must_use]
    pub const fn is_object(&self) -> bool {
        self.object
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Bulk-read page request: `{path}?limit=N[&continue=..][&labelSelector=..]`
///
/// # Errors
///
/// Returns an error if the request cannot be built from the query
pub fn list_request(
    kind: &ResourceKind,
    query: &WatchQuery,
    page_size: u32,
    continue_token: Option<&str>,
) -> Result<http::Request<Vec<u8>>, WatchError> {
    let path = kind.collection_path(query.namespace.as_deref());
    Ok(Request::new(path).list(&query.list_params(page_size, continue_token))?)
}

/// Single-object read: `{path}/{name}`
///
/// # Errors
///
/// Returns an error if the query names no object or the request cannot be built
pub fn object_request(
    kind: &ResourceKind,
    query: &WatchQuery,
) -> Result<http::Request<Vec<u8>>, WatchError> {
    let name = query
        .name
        .as_deref()
        .ok_or_else(|| WatchError::fetch(None, "object request without a name"))?;
    let path = kind.collection_path(query.namespace.as_deref());
    Ok(Request::new(path).get(name, &GetParams::default())?)
}

/// Path and query of the streaming endpoint, resuming at `resource_version`.
///
/// Object watches narrow the collection with `metadata.name=<name>`.
///
/// # Errors
///
/// Returns an error if the request cannot be built from the query
pub fn watch_path(
    kind: &ResourceKind,
    query: &WatchQuery,
    resource_version: &str,
) -> Result<String, WatchError> {
    let path = kind.collection_path(query.namespace.as_deref());
    let request = Request::new(path).watch(&query.watch_params(), resource_version)?;
    Ok(request.uri().to_string())
}

/// Where streaming connections go when they leave the API client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub secure: bool,
    pub host: String,
}

impl StreamEndpoint {
    #[must_use]
    pub fn new(host: &str, secure: bool) -> Self {
        Self {
            secure,
            host: host.to_string(),
        }
    }

    /// Full socket URL: `wss://host/path?watch=true...` (or `ws://` on insecure origins)
    #[must_use]
    pub fn url(&self, path_and_query: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{path_and_query}", self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceKind {
        ResourceKind::new(KindRef::new("", "v1", "Pod"), "pods")
    }

    #[test]
    fn test_selector_normalization() {
        assert_eq!(Selector::parse("app=web,tier=db"), Selector::parse(" tier == db , app = web "));
        assert_eq!(
            Selector::parse("env in (prod, dev),app=web"),
            Selector::parse("app=web, env  in (dev,prod)")
        );
        assert_eq!(
            Selector::parse("app=web,tier=db").to_query().as_deref(),
            Some("app=web,tier=db")
        );
        assert!(Selector::parse(" , ").is_empty());
    }

    #[test]
    fn test_unbalanced_parentheses_are_kept_verbatim() {
        assert_eq!(Selector::parse("app)x(").to_query().as_deref(), Some("app)x("));
        assert_eq!(Selector::parse("env in (a").to_query().as_deref(), Some("envin(a"));
        assert_eq!(Selector::parse("x ) y (").to_query().as_deref(), Some("x)y("));
    }

    #[test]
    fn test_selector_from_labels_matches_parsed_form() {
        let labels = BTreeMap::from([
            ("tier".to_string(), "db".to_string()),
            ("app".to_string(), "web".to_string()),
        ]);
        assert_eq!(Selector::from_labels(&labels), Selector::parse("app = web, tier == db"));
    }

    #[test]
    fn test_identical_queries_share_id() {
        let kind = KindRef::new("", "v1", "Pod");
        let a = WatchQuery::list().namespace("default").labels("b=2,a=1");
        let b = WatchQuery::list().labels("a=1, b=2").namespace("default");
        assert_eq!(SubscriptionId::new(&kind, &a), SubscriptionId::new(&kind, &b));

        let other_ns = WatchQuery::list().namespace("kube-system").labels("a=1,b=2");
        assert_ne!(SubscriptionId::new(&kind, &a), SubscriptionId::new(&kind, &other_ns));

        let other_cluster = a.clone().cluster("east");
        assert_ne!(SubscriptionId::new(&kind, &a), SubscriptionId::new(&kind, &other_cluster));

        let object = WatchQuery::object("web-0").namespace("default");
        assert!(SubscriptionId::new(&kind, &object).as_str().contains("|object|"));
    }

    #[test]
    fn test_list_request_carries_page_size_and_token() {
        let query = WatchQuery::list().namespace("default").labels("app=web");
        let req = list_request(&pods(), &query, 250, Some("abc")).unwrap();
        let uri = req.uri().to_string();
        assert!(uri.starts_with("/api/v1/namespaces/default/pods?"));
        assert!(uri.contains("limit=250"));
        assert!(uri.contains("continue=abc"));
        assert!(uri.contains("labelSelector=app%3Dweb"));
    }

    #[test]
    fn test_explicit_limit_overrides_page_size() {
        let query = WatchQuery::list().limit(10);
        let req = list_request(&pods(), &query, 250, None).unwrap();
        assert!(req.uri().to_string().contains("limit=10"));
    }

    #[test]
    fn test_object_request_path() {
        let query = WatchQuery::object("web-0").namespace("default");
        let req = object_request(&pods(), &query).unwrap();
        assert_eq!(req.uri().path(), "/api/v1/namespaces/default/pods/web-0");
        assert!(object_request(&pods(), &WatchQuery::list()).is_err());
    }

    #[test]
    fn test_watch_path_narrows_objects_by_name() {
        let query = WatchQuery::object("web-0").namespace("default");
        let path = watch_path(&pods(), &query, "42").unwrap();
        assert!(path.starts_with("/api/v1/namespaces/default/pods?"));
        assert!(path.contains("watch=true"));
        assert!(path.contains("resourceVersion=42"));
        assert!(path.contains("fieldSelector=metadata.name%3Dweb-0"));
    }

    #[test]
    fn test_stream_endpoint_scheme() {
        let secure = StreamEndpoint::new("console.example.com", true);
        assert_eq!(
            secure.url("/api/v1/pods?watch=true"),
            "wss://console.example.com/api/v1/pods?watch=true"
        );
        let plain = StreamEndpoint::new("localhost:9000", false);
        assert!(plain.url("/api/v1/pods").starts_with("ws://localhost:9000"));
    }
}
