// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct vs. forwarding-proxy route selection.

use std::fmt;

use regex::Regex;
use url::Url;

use crate::config::ForwardSettings;
use crate::warn_fmt;

/// How the transport reaches a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteDecision {
    Direct,
    ViaProxy { host: String, port: u16 },
}

impl fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteDecision::Direct => f.write_str("direct"),
            RouteDecision::ViaProxy { host, port } => write!(f, "via {host}:{port}"),
        }
    }
}

/// Pure function of the forwarding settings; built once per snapshot.
#[derive(Debug, Clone)]
pub struct RoutePlanner {
    non_proxy_hosts: Vec<Regex>,
    forward: ForwardSettings,
}

/// Compile one glob: `*` matches `[\w-]*`, everything else is literal.
fn compile_glob(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"[\w-]*");
    Regex::new(&format!("^(?:{body})$"))
}

impl RoutePlanner {
    pub fn new(settings: &ForwardSettings) -> Self {
        let non_proxy_hosts = settings
            .non_proxy_hosts
            .iter()
            .filter_map(|glob| match compile_glob(glob) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn_fmt!("Route", "Ignoring non-proxy host pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();

        Self {
            non_proxy_hosts,
            forward: settings.clone(),
        }
    }

    /// Whether `host` must bypass the forwarding proxy.
    pub fn is_non_proxy_host(&self, host: &str) -> bool {
        self.non_proxy_hosts.iter().any(|re| re.is_match(host))
    }

    pub fn plan(&self, target: &Url) -> RouteDecision {
        let host = target.host_str().unwrap_or_default();
        if self.is_non_proxy_host(host) {
            return RouteDecision::Direct;
        }

        match self.forward.for_scheme(target.scheme()) {
            Some(p) => RouteDecision::ViaProxy {
                host: p.host.clone(),
                port: p.port,
            },
            None => RouteDecision::Direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardProxy;

    fn planner(non_proxy: &[&str], http: Option<(&str, u16)>) -> RoutePlanner {
        RoutePlanner::new(&ForwardSettings {
            http: http.map(|(host, port)| ForwardProxy {
                host: host.to_string(),
                port,
            }),
            https: None,
            non_proxy_hosts: non_proxy.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_non_proxy_glob_routes_direct() {
        let planner = planner(&["*.internal"], Some(("squid", 3128)));

        assert_eq!(planner.plan(&url("http://a.internal/x")), RouteDecision::Direct);
        assert_eq!(
            planner.plan(&url("http://other.com/x")),
            RouteDecision::ViaProxy {
                host: "squid".into(),
                port: 3128
            }
        );
    }

    #[test]
    fn test_glob_star_does_not_cross_dots() {
        let planner = planner(&["*.internal"], Some(("squid", 3128)));
        assert_ne!(planner.plan(&url("http://a.b.internal/")), RouteDecision::Direct);
        assert!(planner.is_non_proxy_host("my-host.internal"));
    }

    #[test]
    fn test_other_characters_are_literal() {
        let planner = planner(&["10.0.0.1", "local?host"], Some(("squid", 3128)));
        assert!(planner.is_non_proxy_host("10.0.0.1"));
        assert!(!planner.is_non_proxy_host("10a0b0c1"));
        assert!(!planner.is_non_proxy_host("localhost"));
    }

    #[test]
    fn test_scheme_without_proxy_is_direct() {
        let planner = planner(&[], Some(("squid", 3128)));
        assert_eq!(planner.plan(&url("https://other.com/")), RouteDecision::Direct);
    }

    #[test]
    fn test_no_proxy_configured_is_direct() {
        let planner = planner(&["*.internal"], None);
        assert_eq!(planner.plan(&url("http://other.com/")), RouteDecision::Direct);
    }
}
