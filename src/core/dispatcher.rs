//! Path to backend dispatch.
//!
//! Routes are matched on segment boundaries, longest prefix first:
//! `/api/courses` matches `/api/courses` and `/api/courses/7`, never
//! `/api/coursesx`. Paths no route claims fall back to the content backend
//! when they start with one of the configured content prefixes and to the
//! primary backend otherwise.
use crate::config::{BackendRole, FallbackConfig, RouteConfig};

/// Result of dispatching one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub backend: BackendRole,
    /// Matched route prefix; `None` when the fallback rule chose the backend
    pub prefix: Option<&'a str>,
    pub strip_prefix: bool,
}

impl<'a> RouteMatch<'a> {
    pub fn is_fallback(&self) -> bool {
        self.prefix.is_none()
    }

    /// Label used for logs and metrics.
    pub fn label(&self) -> &'a str {
        self.prefix.unwrap_or("fallback")
    }

    /// The part of `path` forwarded to the backend.
    pub fn forwarded_path<'p>(&self, path: &'p str) -> &'p str {
        match self.prefix {
            Some(prefix) if self.strip_prefix => path.strip_prefix(prefix).unwrap_or(path),
            _ => path,
        }
    }
}

#[derive(Debug, Clone)]
struct RouteEntry {
    /// Prefix without trailing slashes; empty for a catch-all `/`
    prefix: String,
    backend: BackendRole,
    strip_prefix: bool,
}

impl RouteEntry {
    fn matches(&self, path: &str) -> bool {
        if self.prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Ordered route table with a fallback rule. Immutable after startup.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    content_prefixes: Vec<String>,
}

impl RouteTable {
    pub fn new(routes: &[RouteConfig], fallback: &FallbackConfig) -> Self {
        let mut entries: Vec<RouteEntry> = routes
            .iter()
            .map(|route| RouteEntry {
                prefix: route.prefix.trim_end_matches('/').to_string(),
                backend: route.backend,
                strip_prefix: route.strip_prefix,
            })
            .collect();
        // Stable: equal-length prefixes keep configuration order.
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self {
            entries,
            content_prefixes: fallback.content_prefixes.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick the backend for `path`. Pure function of the path.
    pub fn resolve(&self, path: &str) -> RouteMatch<'_> {
        if let Some(entry) = self.entries.iter().find(|entry| entry.matches(path)) {
            return RouteMatch {
                backend: entry.backend,
                prefix: Some(entry.prefix.as_str()),
                strip_prefix: entry.strip_prefix,
            };
        }

        let backend = if self
            .content_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            BackendRole::Content
        } else {
            BackendRole::Primary
        };

        RouteMatch {
            backend,
            prefix: None,
            strip_prefix: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn default_table() -> RouteTable {
        let config = GatewayConfig::default();
        RouteTable::new(&config.routes, &config.fallback)
    }

    #[test]
    fn test_default_routes() {
        let table = default_table();
        assert_eq!(table.len(), 6);

        for path in ["/auth/login", "/api/courses", "/api/courses/7", "/api/enrollments/3", "/api/admin/users"] {
            let route = table.resolve(path);
            assert_eq!(route.backend, BackendRole::Primary, "{path}");
            assert!(!route.is_fallback(), "{path}");
        }
        for path in ["/api/content/videos/1", "/public/content/logo.png"] {
            let route = table.resolve(path);
            assert_eq!(route.backend, BackendRole::Content, "{path}");
            assert!(!route.is_fallback(), "{path}");
        }
    }

    #[test]
    fn test_segment_boundary() {
        let table = default_table();

        let route = table.resolve("/api/coursesx");
        assert!(route.is_fallback());
        assert_eq!(route.backend, BackendRole::Primary);
        assert_eq!(route.label(), "fallback");
    }

    #[test]
    fn test_fallback_uses_raw_content_prefix() {
        let table = RouteTable::new(&[], &FallbackConfig::default());

        assert_eq!(table.resolve("/api/contentful").backend, BackendRole::Content);
        assert_eq!(table.resolve("/public/content").backend, BackendRole::Content);
        assert_eq!(table.resolve("/").backend, BackendRole::Primary);
        assert_eq!(table.resolve("/metrics").backend, BackendRole::Primary);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let routes = vec![
            RouteConfig::new("/api", BackendRole::Primary),
            RouteConfig::new("/api/content/", BackendRole::Content),
        ];
        let table = RouteTable::new(&routes, &FallbackConfig::default());

        let route = table.resolve("/api/content/1");
        assert_eq!(route.backend, BackendRole::Content);
        assert_eq!(route.prefix, Some("/api/content"));
        assert_eq!(table.resolve("/api/other").backend, BackendRole::Primary);
    }

    #[test]
    fn test_forwarded_path_strip() {
        let routes = vec![RouteConfig {
            prefix: "/media".to_string(),
            backend: BackendRole::Content,
            strip_prefix: true,
        }];
        let table = RouteTable::new(&routes, &FallbackConfig::default());

        let route = table.resolve("/media/a/b");
        assert_eq!(route.forwarded_path("/media/a/b"), "/a/b");
        assert_eq!(route.forwarded_path("/media"), "");

        let fallback = table.resolve("/other");
        assert_eq!(fallback.forwarded_path("/other"), "/other");
    }

    #[test]
    fn test_root_route_catches_everything() {
        let routes = vec![
            RouteConfig::new("/", BackendRole::Content),
            RouteConfig::new("/auth", BackendRole::Primary),
        ];
        let table = RouteTable::new(&routes, &FallbackConfig::default());

        assert_eq!(table.resolve("/auth/me").backend, BackendRole::Primary);
        let route = table.resolve("/anything");
        assert_eq!(route.backend, BackendRole::Content);
        assert!(!route.is_fallback());
    }
}
