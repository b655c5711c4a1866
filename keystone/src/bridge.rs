// src/bridge.rs
use crate::error::{KeystoneError, KeystoneResult};
use crate::exchange::ExchangeState;
use crate::parser::Request;
use crate::router::{HandlerRef, ParamArray};
use bumpalo::Bump;
use mlua::{AnyUserData, Function, Lua, MetaMethod, Table, UserData, UserDataMethods, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// A route registration recorded while the user script runs. The worker
/// drains these into its radix tree once the script has finished.
pub struct RouteSpec {
    pub method: String,
    pub pattern: String,
    pub handler: HandlerRef,
}

/// Per-worker scripting side: one interpreter, one reusable exchange
/// userdata, one headers proxy, one cached params table. Handlers are
/// plain function handles indexed by `HandlerRef`; holding the handle
/// pins the function in the interpreter's registry.
///
/// Nothing here is shared across workers and nothing here is re-entrant:
/// a handler runs to completion before the worker touches the exchange
/// again.
pub struct ScriptBridge {
    lua: Lua,
    state: Rc<RefCell<ExchangeState>>,
    exchange: AnyUserData,
    handlers: Rc<RefCell<Vec<Function>>>,
    pending: Rc<RefCell<Vec<RouteSpec>>>,
}

impl ScriptBridge {
    pub fn new() -> KeystoneResult<Self> {
        let lua = Lua::new();
        let state = Rc::new(RefCell::new(ExchangeState::new()));
        let handlers: Rc<RefCell<Vec<Function>>> = Rc::new(RefCell::new(Vec::new()));
        let pending: Rc<RefCell<Vec<RouteSpec>>> = Rc::new(RefCell::new(Vec::new()));

        let module = lua.create_table()?;
        let reg_handlers = Rc::clone(&handlers);
        let reg_pending = Rc::clone(&pending);
        let add_route = lua.create_function(
            move |_, (method, pattern, handler): (String, String, Value)| {
                let handler = match handler {
                    Value::Function(f) => f,
                    other => {
                        return Err(mlua::Error::RuntimeError(format!(
                            "add_route: handler for {} {} must be a function, got {}",
                            method,
                            pattern,
                            other.type_name()
                        )))
                    }
                };
                let mut funcs = reg_handlers.borrow_mut();
                let id = HandlerRef(funcs.len() as u32);
                funcs.push(handler);
                reg_pending.borrow_mut().push(RouteSpec {
                    method,
                    pattern,
                    handler: id,
                });
                Ok(())
            },
        )?;
        module.set("add_route", add_route)?;
        lua.globals().set("keystone", module)?;

        let headers = lua.create_userdata(HeadersProxy {
            state: Rc::clone(&state),
        })?;
        let params = lua.create_table()?;
        let exchange = lua.create_userdata(ExchangeHandle {
            state: Rc::clone(&state),
            headers,
            params,
        })?;

        Ok(Self {
            lua,
            state,
            exchange,
            handlers,
            pending,
        })
    }

    /// Run the user script. Routes it registers pile up until
    /// `drain_routes`.
    pub fn load_script(&self, source: &str) -> KeystoneResult<()> {
        self.lua.load(source).set_name("routes").exec()?;
        Ok(())
    }

    pub fn drain_routes(&self) -> Vec<RouteSpec> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    /// Rebind the reusable exchange at the current request.
    pub fn begin_request(&self, req: &Request<'_>, params: &ParamArray, arena: &Bump) {
        self.state.borrow_mut().begin(req, params, arena);
    }

    /// Drop the request views once the response has been serialized.
    pub fn finish_request(&self) {
        self.state.borrow_mut().finish();
    }

    /// Protected call of the handler with the exchange as its argument.
    /// A script error comes back as `KeystoneError::Script`.
    pub fn invoke(&self, handler: HandlerRef) -> KeystoneResult<()> {
        let func = {
            let funcs = self.handlers.borrow();
            funcs.get(handler.0 as usize).cloned()
        };
        let func = func.ok_or_else(|| {
            KeystoneError::Other(format!("handler ref {} is not registered", handler.0))
        })?;
        func.call::<()>(&self.exchange)?;
        Ok(())
    }

    /// Response side of the exchange, for serialization.
    pub fn state(&self) -> &Rc<RefCell<ExchangeState>> {
        &self.state
    }
}

/// `ctx` as the script sees it. `__index` serves the read surface,
/// `__newindex` the writes; anything unknown reads nil and writes are
/// dropped silently.
struct ExchangeHandle {
    state: Rc<RefCell<ExchangeState>>,
    headers: AnyUserData,
    params: Table,
}

impl ExchangeHandle {
    fn refill_params(&self, lua: &Lua) -> mlua::Result<()> {
        // Lazily cleared and refilled: the table is only touched when a
        // handler actually reads ctx.params.
        self.params.clear()?;
        {
            let state = self.state.borrow();
            for (name, value) in state.params().iter() {
                let n = lua.create_string(unsafe { name.as_bytes() })?;
                let v = lua.create_string(unsafe { value.as_bytes() })?;
                self.params.set(n, v)?;
            }
        }
        self.state.borrow_mut().mark_params_clean();
        Ok(())
    }
}

impl UserData for ExchangeHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let Value::String(key) = key else {
                return Ok(Value::Nil);
            };
            match &*key.as_bytes() {
                b"method" => {
                    let view = this.state.borrow().method_view();
                    lua.create_string(unsafe { view.as_bytes() }).map(Value::String)
                }
                b"path" => {
                    let view = this.state.borrow().path_view();
                    lua.create_string(unsafe { view.as_bytes() }).map(Value::String)
                }
                b"body" => {
                    let view = this.state.borrow().body_view();
                    lua.create_string(unsafe { view.as_bytes() }).map(Value::String)
                }
                b"status" => Ok(Value::Integer(this.state.borrow().status as i64)),
                b"params" => {
                    if this.state.borrow().params_dirty() {
                        this.refill_params(lua)?;
                    }
                    Ok(Value::Table(this.params.clone()))
                }
                b"headers" => Ok(Value::UserData(this.headers.clone())),
                _ => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::NewIndex, |_, this, (key, value): (Value, Value)| {
            let Value::String(key) = key else {
                return Ok(());
            };
            match &*key.as_bytes() {
                b"status" => {
                    let status = match value {
                        Value::Integer(n) => n,
                        Value::Number(f) if f.fract() == 0.0 => f as i64,
                        _ => return Ok(()),
                    };
                    if (0..=u16::MAX as i64).contains(&status) {
                        this.state.borrow_mut().status = status as u16;
                    } else {
                        // Out-of-range writes serialize as 500 later.
                        this.state.borrow_mut().status = 0;
                    }
                }
                b"body" => {
                    if let Value::String(s) = value {
                        this.state.borrow_mut().set_body_from(&s.as_bytes());
                    }
                }
                // method, path, params and everything else: read-only.
                _ => {}
            }
            Ok(())
        });
    }
}

/// `ctx.headers`. Reads scan request headers first, then whatever the
/// script has set; writes append to the response list.
struct HeadersProxy {
    state: Rc<RefCell<ExchangeState>>,
}

impl UserData for HeadersProxy {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| {
            let Value::String(key) = key else {
                return Ok(Value::Nil);
            };
            let name = key.as_bytes();
            let state = this.state.borrow();
            if let Some(v) = state.find_request_header(&name) {
                return lua.create_string(unsafe { v.as_bytes() }).map(Value::String);
            }
            if let Some(v) = state.find_response_header(&name) {
                return lua.create_string(unsafe { v.as_bytes() }).map(Value::String);
            }
            Ok(Value::Nil)
        });

        methods.add_meta_method(MetaMethod::NewIndex, |_, this, (key, value): (Value, Value)| {
            if let (Value::String(name), Value::String(value)) = (key, value) {
                this.state
                    .borrow_mut()
                    .push_response_header(&name.as_bytes(), &value.as_bytes());
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, ParseOutcome};
    use crate::router::Router;

    fn serve(bridge: &ScriptBridge, router: &Router, raw: &[u8]) -> (u16, Vec<u8>) {
        let arena = Bump::new();
        let mut params = ParamArray::new();
        let ParseOutcome::Complete { req, .. } = parser::parse(raw) else {
            panic!("test request must parse");
        };
        let handler = router
            .lookup(req.method, req.path, &mut params)
            .expect("route must match");
        bridge.begin_request(&req, &params, &arena);
        bridge.invoke(handler).expect("handler must not error");
        let state = bridge.state().borrow();
        let body = unsafe { state.response_body().as_bytes() }.to_vec();
        let status = state.status;
        drop(state);
        bridge.finish_request();
        (status, body)
    }

    fn build(script: &str) -> (ScriptBridge, Router) {
        let bridge = ScriptBridge::new().unwrap();
        bridge.load_script(script).unwrap();
        let mut router = Router::new();
        for spec in bridge.drain_routes() {
            router
                .add_route(&spec.method, &spec.pattern, spec.handler)
                .unwrap();
        }
        (bridge, router)
    }

    #[test]
    fn registration_and_invocation() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/ping", function(ctx)
                ctx.status = 200
                ctx.body = "pong"
            end)
            "#,
        );
        let (status, body) = serve(&bridge, &router, b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status, 200);
        assert_eq!(body, b"pong");
    }

    #[test]
    fn params_reach_the_script() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/users/{id}", function(ctx)
                ctx.body = ctx.params.id
            end)
            "#,
        );
        let (_, body) = serve(&bridge, &router, b"GET /users/42 HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"42");
    }

    #[test]
    fn request_views_are_readable() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("POST", "/echo", function(ctx)
                ctx.body = ctx.method .. " " .. ctx.path .. " " .. ctx.body
            end)
            "#,
        );
        let (_, body) = serve(
            &bridge,
            &router,
            b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi",
        );
        assert_eq!(body, b"POST /echo hi");
    }

    #[test]
    fn header_reads_are_case_insensitive() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/h", function(ctx)
                ctx.body = ctx.headers["hOsT"] or "missing"
            end)
            "#,
        );
        let (_, body) = serve(&bridge, &router, b"GET /h HTTP/1.1\r\nHost: example\r\n\r\n");
        assert_eq!(body, b"example");
    }

    #[test]
    fn header_writes_land_in_the_response() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/h", function(ctx)
                ctx.headers["X-Backend"] = "keystone"
                ctx.body = ctx.headers["X-Backend"]
            end)
            "#,
        );
        let (_, body) = serve(&bridge, &router, b"GET /h HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"keystone");
        // serve() finished the request, so inspect via a fresh one.
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/h", function(ctx)
                ctx.headers["X-Backend"] = "keystone"
            end)
            "#,
        );
        let arena = Bump::new();
        let params = ParamArray::new();
        let ParseOutcome::Complete { req, .. } = parser::parse(b"GET /h HTTP/1.1\r\n\r\n") else {
            unreachable!()
        };
        let mut p = params;
        let handler = router.lookup("GET", "/h", &mut p).unwrap();
        bridge.begin_request(&req, &p, &arena);
        bridge.invoke(handler).unwrap();
        let state = bridge.state().borrow();
        assert_eq!(
            state.response_headers(),
            &[("X-Backend".to_string(), "keystone".to_string())]
        );
    }

    #[test]
    fn writes_to_read_only_fields_are_ignored() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/ro", function(ctx)
                ctx.method = "POST"
                ctx.path = "/elsewhere"
                ctx.params = {}
                ctx.body = ctx.method .. " " .. ctx.path
            end)
            "#,
        );
        let (_, body) = serve(&bridge, &router, b"GET /ro HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"GET /ro");
    }

    #[test]
    fn script_error_surfaces_as_script_variant() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/boom", function(ctx)
                error("boom")
            end)
            "#,
        );
        let arena = Bump::new();
        let mut params = ParamArray::new();
        let ParseOutcome::Complete { req, .. } = parser::parse(b"GET /boom HTTP/1.1\r\n\r\n")
        else {
            unreachable!()
        };
        let handler = router.lookup("GET", "/boom", &mut params).unwrap();
        bridge.begin_request(&req, &params, &arena);
        let err = bridge.invoke(handler).unwrap_err();
        assert!(matches!(err, KeystoneError::Script(_)));
        bridge.finish_request();
    }

    #[test]
    fn non_callable_handler_is_rejected_at_registration() {
        let bridge = ScriptBridge::new().unwrap();
        let err = bridge
            .load_script(r#"keystone.add_route("GET", "/x", 42)"#)
            .unwrap_err();
        assert!(matches!(err, KeystoneError::Script(_)));
    }

    #[test]
    fn unregistered_ref_fails_invoke() {
        let bridge = ScriptBridge::new().unwrap();
        assert!(bridge.invoke(HandlerRef(99)).is_err());
    }

    #[test]
    fn no_state_bleeds_between_requests() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/s", function(ctx)
                ctx.body = tostring(ctx.status)
                ctx.status = 500
            end)
            "#,
        );
        let first = serve(&bridge, &router, b"GET /s HTTP/1.1\r\n\r\n");
        let second = serve(&bridge, &router, b"GET /s HTTP/1.1\r\n\r\n");
        // Both entries observed the reset default, not the 500 left
        // behind by the previous invocation.
        assert_eq!(first, (500, b"200".to_vec()));
        assert_eq!(second, first);
    }

    #[test]
    fn params_table_is_refreshed_per_request() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/p/{a}", function(ctx)
                ctx.body = (ctx.params.a or "?") .. "/" .. (ctx.params.b or "-")
            end)
            keystone.add_route("GET", "/q/{b}", function(ctx)
                ctx.body = (ctx.params.a or "-") .. "/" .. (ctx.params.b or "?")
            end)
            "#,
        );
        let (_, body) = serve(&bridge, &router, b"GET /p/one HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"one/-");
        // The cached table forgot "a" and now carries only "b".
        let (_, body) = serve(&bridge, &router, b"GET /q/two HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"-/two");
    }

    #[test]
    fn fifth_param_is_invisible_to_script() {
        let (bridge, router) = build(
            r#"
            keystone.add_route("GET", "/{a}/{b}/{c}/{d}/{e}", function(ctx)
                ctx.body = ctx.params.e or "dropped"
            end)
            "#,
        );
        let (_, body) = serve(&bridge, &router, b"GET /1/2/3/4/5 HTTP/1.1\r\n\r\n");
        assert_eq!(body, b"dropped");
    }
}
