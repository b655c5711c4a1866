// Script-facing surface, exercised end to end: what a route script can
// read and write through ctx, and how that shows up on the wire.

use keystone::bridge::ScriptBridge;
use keystone::conn::{Conn, Io};
use keystone::metrics::WorkerStats;
use keystone::router::Router;

fn gateway(script: &str) -> (ScriptBridge, Router) {
    let bridge = ScriptBridge::new().expect("interpreter");
    bridge.load_script(script).expect("script loads");
    let mut router = Router::new();
    for spec in bridge.drain_routes() {
        router
            .add_route(&spec.method, &spec.pattern, spec.handler)
            .expect("route registers");
    }
    (bridge, router)
}

fn exchange(bridge: &ScriptBridge, router: &Router, raw: &[u8]) -> Vec<u8> {
    let stats = WorkerStats::new();
    let mut conn = Conn::new();
    conn.open(3);
    conn.ring.writable()[..raw.len()].copy_from_slice(raw);
    let action = conn.on_recv_complete(raw.len() as i32, router, bridge, &stats);
    assert_eq!(action, Io::Send);
    conn.write_buf[..conn.write_len].to_vec()
}

#[test]
fn script_headers_appear_on_the_wire() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/h", function(ctx)
            ctx.headers["Content-Type"] = "text/plain"
            ctx.headers["X-Backend"] = "keystone"
            ctx.body = "ok"
        end)
        "#,
    );
    let out = exchange(&bridge, &router, b"GET /h HTTP/1.1\r\n\r\n");
    assert_eq!(
        out,
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Backend: keystone\r\nContent-Length: 2\r\n\r\nok"
    );
}

#[test]
fn request_headers_are_visible_case_insensitively() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/ua", function(ctx)
            ctx.body = ctx.headers["user-agent"] or "none"
        end)
        "#,
    );
    let out = exchange(
        &bridge,
        &router,
        b"GET /ua HTTP/1.1\r\nUser-Agent: smoke/1.0\r\n\r\n",
    );
    assert!(out.ends_with(b"\r\n\r\nsmoke/1.0"));
}

#[test]
fn a_header_the_script_set_reads_back() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/rb", function(ctx)
            ctx.headers["X-Token"] = "abc"
            ctx.body = ctx.headers["x-token"]
        end)
        "#,
    );
    let out = exchange(&bridge, &router, b"GET /rb HTTP/1.1\r\n\r\n");
    assert!(out.ends_with(b"\r\n\r\nabc"));
}

#[test]
fn custom_method_names_route() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("PURGE", "/cache/{key}", function(ctx)
            ctx.status = 201
            ctx.body = "purged " .. ctx.params.key
        end)
        "#,
    );
    let out = exchange(&bridge, &router, b"PURGE /cache/users HTTP/1.1\r\n\r\n");
    assert_eq!(
        out,
        b"HTTP/1.1 201 Created\r\nContent-Length: 12\r\n\r\npurged users"
    );
}

#[test]
fn script_content_length_cannot_lie() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/cl", function(ctx)
            ctx.headers["Content-Length"] = "9999"
            ctx.body = "four"
        end)
        "#,
    );
    let out = exchange(&bridge, &router, b"GET /cl HTTP/1.1\r\n\r\n");
    assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nfour");
}

#[test]
fn out_of_range_script_status_serializes_as_500() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/st", function(ctx)
            ctx.status = 9999
            ctx.body = "kept"
        end)
        "#,
    );
    let out = exchange(&bridge, &router, b"GET /st HTTP/1.1\r\n\r\n");
    assert_eq!(
        out,
        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\n\r\nkept"
    );
}

#[test]
fn handler_without_writes_yields_empty_200() {
    let (bridge, router) = gateway(
        r#"keystone.add_route("GET", "/noop", function(ctx) end)"#,
    );
    let out = exchange(&bridge, &router, b"GET /noop HTTP/1.1\r\n\r\n");
    assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
}

#[test]
fn later_registration_wins_for_the_same_route() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/v", function(ctx) ctx.body = "first" end)
        keystone.add_route("GET", "/v", function(ctx) ctx.body = "second" end)
        "#,
    );
    let out = exchange(&bridge, &router, b"GET /v HTTP/1.1\r\n\r\n");
    assert!(out.ends_with(b"\r\n\r\nsecond"));
}

#[test]
fn query_string_is_not_part_of_the_routed_path() {
    let (bridge, router) = gateway(
        r#"
        keystone.add_route("GET", "/search", function(ctx)
            ctx.body = ctx.path
        end)
        "#,
    );
    let out = exchange(&bridge, &router, b"GET /search?q=keystone HTTP/1.1\r\n\r\n");
    assert!(out.ends_with(b"\r\n\r\n/search"));
}
