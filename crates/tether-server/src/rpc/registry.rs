//! Module registry, route resolution and dispatch.
//!
//! A [`Module`] is a named group of operations. Each operation is registered
//! under two keys: the primary `verb:noun` key derived from its name and an
//! alternate `verb:fullname` key used by forced-POST calls and the verb
//! fallback. Lookup always prefers primary keys, so resolution does not
//! depend on registration order.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tether_core::route::{self, Verb};
use tether_core::RpcError;
use tracing::{debug, instrument, warn};

use super::args::Args;
use super::context::RequestContext;
use super::reply::Reply;
use crate::hub::SubscriptionHooks;
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL, RPC_REQUEST_DURATION_SECONDS};

/// Handler calls slower than this are logged.
const SLOW_CALL: Duration = Duration::from_secs(5);

/// Implemented by every operation.
///
/// Any `Fn(Args) -> impl Future<Output = Result<Reply, RpcError>>` closure is
/// a handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Run the operation. The call's [`RequestContext`] is in scope.
    async fn handle(&self, args: Args) -> Result<Reply, RpcError>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Args) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Reply, RpcError>> + Send,
{
    async fn handle(&self, args: Args) -> Result<Reply, RpcError> {
        self(args).await
    }
}

/// Registration failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Module name is empty or contains `/`.
    #[error("invalid module name `{0}`")]
    InvalidModuleName(String),

    /// Two modules share a (case-insensitive) name.
    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    /// Two operations map to the same route key.
    #[error("module `{module}`: `{second}` collides with `{first}` on route `{key}`")]
    DuplicateRoute {
        /// Module name.
        module: String,
        /// Colliding key.
        key: String,
        /// Operation registered first.
        first: String,
        /// Operation registered second.
        second: String,
    },

    /// Roles declared for an operation that does not exist.
    #[error("module `{module}`: roles declared for unknown operation `{method}`")]
    UnknownOperation {
        /// Module name.
        module: String,
        /// Method name.
        method: String,
    },
}

/// Static facts about one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationDescriptor {
    /// Owning module.
    pub module: String,
    /// Declared method name, e.g. `getUser`.
    pub method: String,
    /// Verb derived from the name.
    pub verb: Verb,
    /// Name with the verb prefix stripped.
    pub noun: String,
    /// Roles required to call; empty means public.
    pub roles: BTreeSet<String>,
}

impl OperationDescriptor {
    /// Metric/log label, `module.method`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.module, self.method)
    }
}

/// A registered operation.
pub struct Operation {
    descriptor: OperationDescriptor,
    handler: Arc<dyn MethodHandler>,
}

impl Operation {
    /// Static facts.
    pub fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }
}

/// Named group of operations plus optional hub hooks.
pub struct Module {
    name: String,
    operations: Vec<Arc<Operation>>,
    primary: HashMap<String, usize>,
    alternate: HashMap<String, usize>,
    hooks: Option<Arc<dyn SubscriptionHooks>>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("operations", &self.operations.len())
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl Module {
    /// Start building a module.
    pub fn builder(name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder {
            name: name.into(),
            entries: Vec::new(),
            roles: HashMap::new(),
            hooks: None,
        }
    }

    /// Module name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptors in registration order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.iter().map(|op| &op.descriptor)
    }

    /// Hub hooks, if any.
    pub fn hooks(&self) -> Option<&Arc<dyn SubscriptionHooks>> {
        self.hooks.as_ref()
    }

    fn lookup(&self, key: &str) -> Option<&Arc<Operation>> {
        self.primary
            .get(key)
            .or_else(|| self.alternate.get(key))
            .and_then(|&i| self.operations.get(i))
    }

    /// Find the operation for `verb` and path segment `segment`.
    ///
    /// Unmatched POSTs retry against the GET then DELETE key spaces.
    pub fn resolve(&self, verb: Verb, segment: &str) -> Option<Arc<Operation>> {
        if let Some(op) = self.lookup(&route::route_key(verb, segment)) {
            return Some(Arc::clone(op));
        }
        route::fallback_verbs(verb)
            .iter()
            .find_map(|&fallback| self.lookup(&route::route_key(fallback, segment)))
            .map(Arc::clone)
    }
}

/// Builder for [`Module`].
pub struct ModuleBuilder {
    name: String,
    entries: Vec<(String, Arc<dyn MethodHandler>)>,
    roles: HashMap<String, BTreeSet<String>>,
    hooks: Option<Arc<dyn SubscriptionHooks>>,
}

impl ModuleBuilder {
    /// Add an operation. Its verb and path come from `method`.
    #[must_use]
    pub fn operation<H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: MethodHandler + 'static,
    {
        self.entries.push((method.into(), Arc::new(handler)));
        self
    }

    /// Require any of `roles` to call `method`.
    #[must_use]
    pub fn roles<I, S>(mut self, method: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles
            .entry(method.into())
            .or_default()
            .extend(roles.into_iter().map(Into::into));
        self
    }

    /// Attach hub connect/disconnect hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl SubscriptionHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Validate routes and build the module.
    pub fn build(mut self) -> Result<Module, RegistryError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(RegistryError::InvalidModuleName(self.name));
        }
        if let Some(method) = self
            .roles
            .keys()
            .find(|m| !self.entries.iter().any(|(name, _)| name == *m))
        {
            return Err(RegistryError::UnknownOperation {
                module: self.name.clone(),
                method: method.clone(),
            });
        }

        let mut operations = Vec::with_capacity(self.entries.len());
        let mut primary: HashMap<String, usize> = HashMap::new();
        let mut alternate: HashMap<String, usize> = HashMap::new();

        for (index, (method, handler)) in self.entries.into_iter().enumerate() {
            let (verb, noun) = route::split_method_name(&method);
            let keys = [
                (&mut primary, route::route_key(verb, noun)),
                (&mut alternate, route::route_key(verb, &method)),
            ];
            for (table, key) in keys {
                if let Some(&existing) = table.get(&key) {
                    let first = operations
                        .get(existing)
                        .map(|op: &Arc<Operation>| op.descriptor.method.clone())
                        .unwrap_or_default();
                    return Err(RegistryError::DuplicateRoute {
                        module: self.name,
                        key,
                        first,
                        second: method,
                    });
                }
                let _ = table.insert(key, index);
            }

            let descriptor = OperationDescriptor {
                module: self.name.clone(),
                verb,
                noun: noun.to_owned(),
                roles: self.roles.remove(&method).unwrap_or_default(),
                method,
            };
            operations.push(Arc::new(Operation {
                descriptor,
                handler,
            }));
        }

        Ok(Module {
            name: self.name,
            operations,
            primary,
            alternate,
            hooks: self.hooks,
        })
    }
}

/// A request matched to an operation.
pub struct Resolved {
    /// The matched operation.
    pub operation: Arc<Operation>,
    /// Undecoded path segments after the operation segment.
    pub path_args: Vec<String>,
}

/// All registered modules.
#[derive(Default)]
pub struct Dispatcher {
    modules: HashMap<String, Arc<Module>>,
}

impl Dispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module.
    pub fn register(&mut self, module: Module) -> Result<(), RegistryError> {
        let key = module.name.to_lowercase();
        if self.modules.contains_key(&key) {
            return Err(RegistryError::DuplicateModule(module.name));
        }
        debug!(module = %module.name, operations = module.operations.len(), "module registered");
        let _ = self.modules.insert(key, Arc::new(module));
        Ok(())
    }

    /// Builder-style [`Dispatcher::register`].
    pub fn with_module(mut self, module: Module) -> Result<Self, RegistryError> {
        self.register(module)?;
        Ok(self)
    }

    /// Registered modules.
    pub fn modules(&self) -> impl Iterator<Item = &Arc<Module>> {
        self.modules.values()
    }

    /// Module count.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Operation count across modules.
    pub fn operation_count(&self) -> usize {
        self.modules.values().map(|m| m.operations.len()).sum()
    }

    /// Hooks of every module that declares them.
    pub fn hooks(&self) -> Vec<Arc<dyn SubscriptionHooks>> {
        self.modules
            .values()
            .filter_map(|m| m.hooks.clone())
            .collect()
    }

    /// Resolve `path` (already stripped of the dispatcher prefix).
    pub fn resolve(&self, verb: Verb, path: &str) -> Result<Resolved, RpcError> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let module_name = segments
            .next()
            .ok_or_else(|| RpcError::not_found("No module specified"))?;
        let module = self
            .modules
            .get(&module_name.to_lowercase())
            .ok_or_else(|| RpcError::not_found(format!("Unknown module '{module_name}'")))?;
        let segment = segments.next().ok_or_else(|| {
            RpcError::not_found(format!("No operation specified for module '{module_name}'"))
        })?;
        let operation = module.resolve(verb, segment).ok_or_else(|| {
            RpcError::not_found(format!(
                "No operation '{segment}' for {verb} in module '{module_name}'"
            ))
        })?;

        Ok(Resolved {
            operation,
            path_args: segments.map(str::to_owned).collect(),
        })
    }

    /// Run a resolved operation inside `ctx`, recording metrics.
    #[instrument(skip_all, fields(method = %resolved.operation.descriptor.label(), call_id = %ctx.call_id()))]
    pub async fn invoke(
        &self,
        resolved: &Resolved,
        args: Args,
        ctx: RequestContext,
    ) -> Result<Reply, RpcError> {
        let label = resolved.operation.descriptor.label();
        counter!(RPC_REQUESTS_TOTAL, "method" => label.clone()).increment(1);

        let handler = Arc::clone(&resolved.operation.handler);
        let start = Instant::now();
        let result = ctx.scope(async move { handler.handle(args).await }).await;
        let elapsed = start.elapsed();

        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => label.clone())
            .record(elapsed.as_secs_f64());
        if let Err(err) = &result {
            counter!(RPC_ERRORS_TOTAL, "method" => label.clone(), "error_type" => err.code())
                .increment(1);
            debug!(code = err.code(), error = %err, "operation failed");
        }
        if elapsed >= SLOW_CALL {
            warn!(method = %label, duration_secs = elapsed.as_secs_f64(), "slow operation");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::{HeaderMap, Method, Uri};
    use tether_core::Principal;

    use super::*;
    use crate::rpc::context::{self, RequestParts};
    use crate::session::MemorySessionProvider;

    impl std::fmt::Debug for Resolved {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Resolved")
                .field("operation", self.operation.descriptor())
                .field("path_args", &self.path_args)
                .finish()
        }
    }

    async fn ok(_: Args) -> Result<Reply, RpcError> {
        Ok(Reply::Empty)
    }

    fn method_of(dispatcher: &Dispatcher, verb: Verb, path: &str) -> String {
        dispatcher
            .resolve(verb, path)
            .map(|r| r.operation.descriptor().method.clone())
            .unwrap_or_else(|e| format!("<{}>", e.code()))
    }

    fn users() -> Dispatcher {
        let module = Module::builder("users")
            .operation("getUser", ok)
            .operation("getUsers", ok)
            .operation("deleteUser", ok)
            .operation("putUser", ok)
            .operation("createUser", ok)
            .roles("deleteUser", ["admin"])
            .build()
            .unwrap();
        Dispatcher::new().with_module(module).unwrap()
    }

    fn test_ctx() -> RequestContext {
        let parts = RequestParts {
            method: Method::POST,
            uri: Uri::from_static("/api/test/op"),
            headers: HeaderMap::new(),
        };
        RequestContext::new(
            parts,
            Some(Principal::new("alice")),
            Arc::new(MemorySessionProvider::new("sid")),
        )
    }

    #[test]
    fn verb_and_noun_route() {
        let d = users();
        assert_eq!(method_of(&d, Verb::Get, "users/user/42"), "getUser");
        assert_eq!(method_of(&d, Verb::Get, "users/users"), "getUsers");
        assert_eq!(method_of(&d, Verb::Delete, "users/user/42"), "deleteUser");
        assert_eq!(method_of(&d, Verb::Put, "users/user"), "putUser");
        assert_eq!(method_of(&d, Verb::Post, "users/createUser"), "createUser");
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let d = users();
        assert_eq!(method_of(&d, Verb::Get, "Users/USER"), "getUser");
    }

    #[test]
    fn forced_post_falls_back_to_full_name() {
        let d = users();
        assert_eq!(method_of(&d, Verb::Post, "users/getUser"), "getUser");
        assert_eq!(method_of(&d, Verb::Post, "users/deleteUser"), "deleteUser");
    }

    #[test]
    fn only_post_falls_back() {
        let d = users();
        assert_eq!(method_of(&d, Verb::Put, "users/createUser"), "<NOT_FOUND>");
        assert_eq!(method_of(&d, Verb::Get, "users/createUser"), "<NOT_FOUND>");
    }

    #[test]
    fn path_args_follow_the_operation() {
        let d = users();
        let resolved = d.resolve(Verb::Get, "users/user/123/true").unwrap();
        assert_eq!(resolved.path_args, vec!["123", "true"]);
    }

    #[test]
    fn unknown_module_and_operation_are_404() {
        let d = users();
        assert_matches!(d.resolve(Verb::Get, "nope/user"), Err(RpcError::NotFound { .. }));
        assert_matches!(d.resolve(Verb::Get, "users"), Err(RpcError::NotFound { .. }));
        assert_matches!(d.resolve(Verb::Get, ""), Err(RpcError::NotFound { .. }));
        assert_matches!(d.resolve(Verb::Get, "users/widget"), Err(RpcError::NotFound { .. }));
    }

    #[test]
    fn primary_key_wins_regardless_of_order() {
        // `getGetUser` owns primary `get:getuser`; `getUser` only has it as alternate.
        for order in [["getUser", "getGetUser"], ["getGetUser", "getUser"]] {
            let module = order
                .iter()
                .fold(Module::builder("m"), |b, name| b.operation(*name, ok))
                .build()
                .unwrap();
            let d = Dispatcher::new().with_module(module).unwrap();
            assert_eq!(method_of(&d, Verb::Get, "m/getUser"), "getGetUser");
            assert_eq!(method_of(&d, Verb::Get, "m/user"), "getUser");
        }
    }

    #[test]
    fn duplicate_primary_is_rejected() {
        let err = Module::builder("m")
            .operation("getUser", ok)
            .operation("get_user", ok)
            .build()
            .unwrap_err();
        assert_matches!(err, RegistryError::DuplicateRoute { ref first, ref second, .. }
            if first == "getUser" && second == "get_user");
    }

    #[test]
    fn roles_for_unknown_operation_are_rejected() {
        let err = Module::builder("m")
            .operation("getUser", ok)
            .roles("deleteUser", ["admin"])
            .build()
            .unwrap_err();
        assert_matches!(err, RegistryError::UnknownOperation { .. });
    }

    #[test]
    fn module_names_are_validated() {
        assert_matches!(
            Module::builder("a/b").build(),
            Err(RegistryError::InvalidModuleName(_))
        );
        let mut d = users();
        let again = Module::builder("USERS").build().unwrap();
        assert_matches!(d.register(again), Err(RegistryError::DuplicateModule(_)));
    }

    #[test]
    fn descriptors_carry_roles() {
        let d = users();
        let resolved = d.resolve(Verb::Delete, "users/user").unwrap();
        let desc = resolved.operation.descriptor();
        assert!(desc.roles.contains("admin"));
        assert_eq!(desc.noun, "User");
        assert_eq!(desc.label(), "users.deleteUser");
        assert_eq!(d.operation_count(), 5);
        assert_eq!(d.module_count(), 1);
    }

    #[tokio::test]
    async fn invoke_runs_handler_inside_context() {
        let module = Module::builder("who")
            .operation("getMe", |_args: Args| async {
                let principal = context::current_principal().map(|p| p.id);
                Ok::<_, RpcError>(Reply::value(principal))
            })
            .build()
            .unwrap();
        let d = Dispatcher::new().with_module(module).unwrap();
        let resolved = d.resolve(Verb::Get, "who/me").unwrap();
        let reply = d.invoke(&resolved, Args::default(), test_ctx()).await.unwrap();
        assert_matches!(reply, Reply::Value(v) if v.as_str() == Some("alice"));
    }

    #[tokio::test]
    async fn invoke_propagates_handler_errors() {
        let module = Module::builder("m")
            .operation("postFail", |_args: Args| async {
                Err::<Reply, _>(RpcError::status(409, "conflict"))
            })
            .build()
            .unwrap();
        let d = Dispatcher::new().with_module(module).unwrap();
        let resolved = d.resolve(Verb::Post, "m/fail").unwrap();
        let err = d.invoke(&resolved, Args::default(), test_ctx()).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    const NAMES: [&str; 8] = [
        "getUser",
        "getUsers",
        "deleteUser",
        "putUser",
        "createUser",
        "getGetUser",
        "postItem",
        "get_order",
    ];

    fn resolve_sample(d: &Dispatcher) -> Vec<String> {
        let requests = [
            (Verb::Get, "m/user/1"),
            (Verb::Get, "m/getUser"),
            (Verb::Get, "m/users"),
            (Verb::Delete, "m/user"),
            (Verb::Put, "m/user"),
            (Verb::Post, "m/createUser"),
            (Verb::Post, "m/getUsers"),
            (Verb::Post, "m/item"),
            (Verb::Get, "m/order"),
            (Verb::Post, "m/get_order"),
        ];
        requests.iter().map(|(verb, path)| method_of(d, *verb, path)).collect()
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn resolution_ignores_registration_order(order in Just(NAMES.to_vec()).prop_shuffle()) {
                let build = |names: &[&str]| {
                    let module = names
                        .iter()
                        .fold(Module::builder("m"), |b, name| b.operation(*name, ok))
                        .build()
                        .unwrap();
                    Dispatcher::new().with_module(module).unwrap()
                };
                prop_assert_eq!(resolve_sample(&build(&order)), resolve_sample(&build(&NAMES)));
            }
        }
    }

    struct Adder;

    #[async_trait]
    impl MethodHandler for Adder {
        async fn handle(&self, args: Args) -> Result<Reply, RpcError> {
            args.expect_len(2)?;
            let sum = args.get::<i64>(0)? + args.get::<i64>(1)?;
            Ok(Reply::value(sum))
        }
    }

    #[tokio::test]
    async fn struct_handlers_work_too() {
        let module = Module::builder("math").operation("add", Adder).build().unwrap();
        let d = Dispatcher::new().with_module(module).unwrap();
        let resolved = d.resolve(Verb::Post, "math/add").unwrap();
        let reply = d
            .invoke(&resolved, Args::new(vec![2_i64.into(), 3_i64.into()]), test_ctx())
            .await
            .unwrap();
        assert_matches!(reply, Reply::Value(v) if v.as_i64() == Some(5));
    }
}
