//! Route documents for the Caddy admin API.
//!
//! Every workspace gets two routes: an exact-match redirect adding the
//! trailing slash, and a prefix route proxying to the guest. Each exposed
//! port gets the same pair one level deeper, with the prefix stripped
//! before proxying. All routes carry stable `@id`s so they can be deleted
//! without reading the current config.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Authentication applied in front of every workspace route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProxyAuth {
    #[default]
    None,
    /// Static credentials; `password_hash` is a bcrypt hash.
    Basic {
        username: String,
        password_hash: String,
    },
    /// Delegate to a verify endpoint; any 2xx lets the request through.
    Forward { dial: String, uri: String },
}

pub fn workspace_route_id(name: &str) -> String {
    format!("ws-{}", name)
}

pub fn workspace_redirect_id(name: &str) -> String {
    format!("ws-{}-redirect", name)
}

pub fn port_route_id(name: &str, port: u16) -> String {
    format!("ws-{}-port-{}", name, port)
}

pub fn port_redirect_id(name: &str, port: u16) -> String {
    format!("ws-{}-port-{}-redirect", name, port)
}

pub fn workspace_prefix(name: &str) -> String {
    format!("/ws/{}", name)
}

pub fn port_prefix(name: &str, port: u16) -> String {
    format!("/ws/{}/ports/{}", name, port)
}

/// Handler prepended to the chain for `auth`, if any.
pub fn auth_handler(auth: &ProxyAuth) -> Option<Value> {
    match auth {
        ProxyAuth::None => None,
        ProxyAuth::Basic {
            username,
            password_hash,
        } => Some(json!({
            "handler": "authentication",
            "providers": {
                "http_basic": {
                    "accounts": [{ "username": username, "password": password_hash }]
                }
            }
        })),
        ProxyAuth::Forward { dial, uri } => Some(json!({
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": dial }],
            "rewrite": { "method": "GET", "uri": uri },
            "headers": {
                "request": {
                    "set": {
                        "X-Forwarded-Method": ["{http.request.method}"],
                        "X-Forwarded-Uri": ["{http.request.uri}"]
                    }
                }
            },
            "handle_response": [{
                "match": { "status_code": [2] },
                "routes": [{ "handle": [{ "handler": "vars" }] }]
            }]
        })),
    }
}

fn redirect_route(id: String, prefix: &str) -> Value {
    json!({
        "@id": id,
        "match": [{ "path": [prefix] }],
        "handle": [{
            "handler": "static_response",
            "status_code": 302,
            "headers": { "Location": [format!("{}/", prefix)] }
        }],
        "terminal": true
    })
}

fn reverse_proxy(dial: &str) -> Value {
    json!({
        "handler": "reverse_proxy",
        "upstreams": [{ "dial": dial }]
    })
}

/// `[redirect, proxy]` routes for a workspace's main service.
pub fn workspace_routes(name: &str, addr: &str, auth: &ProxyAuth) -> [Value; 2] {
    let prefix = workspace_prefix(name);
    let mut handle: Vec<Value> = auth_handler(auth).into_iter().collect();
    handle.push(reverse_proxy(addr));

    [
        redirect_route(workspace_redirect_id(name), &prefix),
        json!({
            "@id": workspace_route_id(name),
            "match": [{
                "path": [format!("{}/*", prefix)],
                "not": [{ "path": [format!("{}/ports/*", prefix)] }]
            }],
            "handle": handle,
            "terminal": true
        }),
    ]
}

/// `[redirect, proxy]` routes for one forwarded guest port.
///
/// `dial` is where the guest port is reachable from the proxy, as resolved
/// by the runtime backend.
pub fn port_routes(name: &str, dial: &str, port: u16, auth: &ProxyAuth) -> [Value; 2] {
    let prefix = port_prefix(name, port);
    let mut handle: Vec<Value> = auth_handler(auth).into_iter().collect();
    handle.push(json!({ "handler": "rewrite", "strip_path_prefix": prefix }));
    handle.push(reverse_proxy(dial));

    [
        redirect_route(port_redirect_id(name, port), &prefix),
        json!({
            "@id": port_route_id(name, port),
            "match": [{ "path": [format!("{}/*", prefix)] }],
            "handle": handle,
            "terminal": true
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_ids() {
        assert_eq!(workspace_route_id("demo"), "ws-demo");
        assert_eq!(workspace_redirect_id("demo"), "ws-demo-redirect");
        assert_eq!(port_route_id("demo", 3000), "ws-demo-port-3000");
        assert_eq!(port_redirect_id("demo", 3000), "ws-demo-port-3000-redirect");
    }

    #[test]
    fn test_workspace_routes_without_auth() {
        let [redirect, proxy] = workspace_routes("demo", "172.16.0.2:8080", &ProxyAuth::None);

        assert_eq!(redirect["@id"], "ws-demo-redirect");
        assert_eq!(redirect["match"][0]["path"][0], "/ws/demo");
        assert_eq!(redirect["handle"][0]["status_code"], 302);
        assert_eq!(redirect["handle"][0]["headers"]["Location"][0], "/ws/demo/");

        assert_eq!(proxy["@id"], "ws-demo");
        assert_eq!(proxy["match"][0]["path"][0], "/ws/demo/*");
        assert_eq!(proxy["match"][0]["not"][0]["path"][0], "/ws/demo/ports/*");
        assert_eq!(proxy["handle"].as_array().unwrap().len(), 1);
        assert_eq!(proxy["handle"][0]["upstreams"][0]["dial"], "172.16.0.2:8080");
        assert_eq!(proxy["terminal"], true);
    }

    #[test]
    fn test_basic_auth_is_prepended() {
        let auth = ProxyAuth::Basic {
            username: "dev".into(),
            password_hash: "$2a$14$hash".into(),
        };
        let [_, proxy] = workspace_routes("demo", "127.0.0.1:49153", &auth);
        let handle = proxy["handle"].as_array().unwrap();
        assert_eq!(handle.len(), 2);
        assert_eq!(handle[0]["handler"], "authentication");
        assert_eq!(
            handle[0]["providers"]["http_basic"]["accounts"][0]["username"],
            "dev"
        );
        assert_eq!(handle[1]["handler"], "reverse_proxy");
    }

    #[test]
    fn test_forward_auth_subrequest() {
        let auth = ProxyAuth::Forward {
            dial: "127.0.0.1:4000".into(),
            uri: "/api/auth/verify".into(),
        };
        let handler = auth_handler(&auth).unwrap();
        assert_eq!(handler["upstreams"][0]["dial"], "127.0.0.1:4000");
        assert_eq!(handler["rewrite"]["uri"], "/api/auth/verify");
        assert_eq!(handler["handle_response"][0]["match"]["status_code"][0], 2);
    }

    #[test]
    fn test_port_routes_strip_prefix_and_dial_guest_port() {
        let [redirect, proxy] = port_routes("demo", "172.16.0.2:3000", 3000, &ProxyAuth::None);
        assert_eq!(redirect["@id"], "ws-demo-port-3000-redirect");
        assert_eq!(redirect["handle"][0]["headers"]["Location"][0], "/ws/demo/ports/3000/");

        assert_eq!(proxy["match"][0]["path"][0], "/ws/demo/ports/3000/*");
        assert_eq!(proxy["handle"][0]["handler"], "rewrite");
        assert_eq!(proxy["handle"][0]["strip_path_prefix"], "/ws/demo/ports/3000");
        assert_eq!(proxy["handle"][1]["upstreams"][0]["dial"], "172.16.0.2:3000");
    }

    #[test]
    fn test_auth_deserializes_from_tagged_config() {
        let auth: ProxyAuth =
            serde_json::from_str(r#"{"mode":"forward","dial":"auth:80","uri":"/verify"}"#).unwrap();
        assert_eq!(
            auth,
            ProxyAuth::Forward {
                dial: "auth:80".into(),
                uri: "/verify".into()
            }
        );
        let none: ProxyAuth = serde_json::from_str(r#"{"mode":"none"}"#).unwrap();
        assert_eq!(none, ProxyAuth::None);
    }
}
