//! In-memory backend used by the unit and property tests.
//!
//! [`InMemoryBackend`] implements [`Transport`] and answers the subset of
//! the Vault HTTP API the clients use, with the same status codes and
//! body shapes: seal lifecycle, ACL policies, KV v1/v2, the Consul
//! engine, tokens, userpass, identity entities and OIDC tokens. It does
//! not split keys with Shamir; any `threshold` distinct issued shares
//! unseal it.

use crate::vault::common::parse_ttl;
use crate::vault::init::decode_share;
use crate::vault::transport::{BackendRequest, BackendResponse, RequestMethod, Transport};
use crate::vault::SecretsError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const DEFAULT_POLICY: &str = r#"
path "auth/token/lookup-self" { capabilities = ["read"] }
path "auth/token/renew-self" { capabilities = ["update"] }
path "auth/token/revoke-self" { capabilities = ["update"] }
path "identity/oidc/introspect" { capabilities = ["update"] }
"#;

const DEFAULT_TOKEN_TTL: u64 = 768 * 3600;

pub struct InMemoryBackend {
    state: Mutex<State>,
}

#[derive(Clone)]
struct TokenEntry {
    id: String,
    accessor: String,
    policies: Vec<String>,
    entity_id: String,
    ttl: u64,
    period: Option<u64>,
    renewable: bool,
    creation_time: u64,
    display_name: String,
    meta: Map<String, Value>,
    path: String,
}

impl TokenEntry {
    fn is_root(&self) -> bool {
        self.policies.iter().any(|p| p == "root")
    }

    fn lookup_json(&self) -> Value {
        json!({
            "accessor": self.accessor,
            "policies": self.policies,
            "creation_time": self.creation_time,
            "expire_time": (self.ttl > 0).then(|| (self.creation_time + self.ttl).to_string()),
            "ttl": self.ttl,
            "period": self.period,
            "renewable": self.renewable,
            "entity_id": self.entity_id,
            "path": self.path,
            "display_name": self.display_name,
            "meta": if self.meta.is_empty() { Value::Null } else { Value::Object(self.meta.clone()) },
        })
    }

    fn auth_json(&self) -> Value {
        json!({
            "client_token": self.id,
            "accessor": self.accessor,
            "policies": self.policies,
            "token_policies": self.policies,
            "metadata": self.meta,
            "lease_duration": self.ttl,
            "renewable": self.renewable,
            "entity_id": self.entity_id,
            "token_type": "service",
            "orphan": false,
        })
    }
}

struct Rule {
    path: String,
    capabilities: Vec<String>,
}

impl Rule {
    fn matches(&self, path: &str) -> bool {
        match self.path.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == self.path,
        }
    }
}

struct Policy {
    document: String,
    rules: Vec<Rule>,
}

/// Reads the `path "..." { capabilities = [...] }` blocks of an HCL policy.
fn parse_policy(document: &str) -> Policy {
    let mut rules = Vec::new();
    let mut rest = document;
    while let Some(start) = rest.find("path \"") {
        let after = &rest[start + 6..];
        let Some(end) = after.find('"') else { break };
        let path = after[..end].to_string();
        let block = &after[end + 1..];
        let block_end = block.find('}').unwrap_or(block.len());
        let body = &block[..block_end];
        let capabilities = match (body.find('['), body.find(']')) {
            (Some(open), Some(close)) if open < close => body[open + 1..close]
                .split(',')
                .map(|c| c.trim().trim_matches('"').to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            _ => Vec::new(),
        };
        rules.push(Rule { path, capabilities });
        rest = &block[block_end..];
    }
    Policy {
        document: document.to_string(),
        rules,
    }
}

struct Mount {
    engine: String,
    accessor: String,
    options: Option<HashMap<String, String>>,
    default_lease_ttl: u64,
}

impl Mount {
    fn new(engine: &str, accessor: String) -> Self {
        Self {
            engine: engine.to_string(),
            accessor,
            options: None,
            default_lease_ttl: 0,
        }
    }

    fn kv(version: &str) -> Self {
        let mut mount = Mount::new("kv", new_accessor("kv"));
        mount.options = Some(HashMap::from([("version".to_string(), version.to_string())]));
        mount
    }

    fn is_kv2(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.get("version"))
            .is_some_and(|v| v == "2")
    }

    fn to_json(&self) -> Value {
        json!({
            "type": self.engine,
            "accessor": self.accessor,
            "options": self.options,
            "config": { "default_lease_ttl": self.default_lease_ttl },
        })
    }
}

struct KvEntry {
    data: Map<String, Value>,
    version: u64,
    /// Set when the latest KV v2 version was soft deleted.
    deletion_time: Option<String>,
}

#[derive(Default)]
struct ConsulEngine {
    access: Option<(String, String)>,
    roles: HashMap<String, Value>,
}

struct User {
    password: String,
    token_ttl: u64,
    policies: Vec<String>,
}

struct Entity {
    name: String,
    metadata: Value,
    policies: Value,
}

struct OidcKey {
    algorithm: String,
    secret: Vec<u8>,
}

struct OidcRole {
    key: String,
    ttl: u64,
    client_id: String,
}

struct RootGeneration {
    nonce: String,
    otp: String,
    progress: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct State {
    initialized: bool,
    sealed: bool,
    standby: bool,
    unreachable: bool,
    threshold: usize,
    shares: Vec<Vec<u8>>,
    unseal_progress: HashSet<Vec<u8>>,
    root_generation: Option<RootGeneration>,
    tokens: HashMap<String, TokenEntry>,
    policies: HashMap<String, Policy>,
    mounts: BTreeMap<String, Mount>,
    auth_mounts: BTreeMap<String, Mount>,
    kv: HashMap<String, BTreeMap<String, KvEntry>>,
    consul: HashMap<String, ConsulEngine>,
    users: HashMap<(String, String), User>,
    entities: HashMap<String, Entity>,
    aliases: HashMap<(String, String), String>,
    oidc_keys: BTreeMap<String, OidcKey>,
    oidc_roles: HashMap<String, OidcRole>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn random_hex(len: usize) -> String {
    let mut out = String::new();
    while out.len() < len {
        out.push_str(&Uuid::new_v4().simple().to_string());
    }
    out.truncate(len);
    out
}

fn new_accessor(kind: &str) -> String {
    format!("{}_{}", kind, random_hex(8))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn ok(body: Value) -> BackendResponse {
    BackendResponse::new(200, body)
}

fn no_content() -> BackendResponse {
    BackendResponse::new(204, json!({}))
}

fn error(status: u16, message: &str) -> BackendResponse {
    BackendResponse::new(status, json!({ "errors": [message] }))
}

fn not_found() -> BackendResponse {
    BackendResponse::new(404, json!({ "errors": [] }))
}

fn permission_denied() -> BackendResponse {
    error(403, "permission denied")
}

fn ttl_field(body: &Value, key: &str) -> Option<u64> {
    match body.get(key)? {
        Value::String(s) => parse_ttl(s),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn str_list(body: &Value, key: &str) -> Option<Vec<String>> {
    match body.get(key)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) => Some(
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

fn list_children<'a>(keys: impl Iterator<Item = &'a String>, prefix: &str) -> BackendResponse {
    let prefix = if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix)
    };
    let children: BTreeSet<String> = keys
        .filter_map(|key| key.strip_prefix(prefix.as_str()))
        .map(|rest| match rest.split_once('/') {
            Some((dir, _)) => format!("{}/", dir),
            None => rest.to_string(),
        })
        .collect();
    if children.is_empty() {
        return not_found();
    }
    ok(json!({ "data": { "keys": children } }))
}

impl State {
    fn mint_token(
        &mut self,
        policies: Vec<String>,
        entity_id: &str,
        ttl: u64,
        display_name: &str,
        path: &str,
    ) -> TokenEntry {
        let policies = if policies.iter().any(|p| p == "root") {
            vec!["root".to_string()]
        } else {
            let mut set: BTreeSet<String> = policies.into_iter().collect();
            set.insert("default".to_string());
            set.into_iter().collect()
        };
        let entry = TokenEntry {
            id: format!("hvs.{}", random_hex(32)),
            accessor: random_hex(24),
            policies,
            entity_id: entity_id.to_string(),
            ttl,
            period: None,
            renewable: ttl > 0,
            creation_time: now(),
            display_name: display_name.to_string(),
            meta: Map::new(),
            path: path.to_string(),
        };
        self.tokens.insert(entry.id.clone(), entry.clone());
        entry
    }

    fn insert_root(&mut self, id: &str) {
        let mut root = self.mint_token(vec!["root".to_string()], "", 0, "root", "auth/token/root");
        self.tokens.remove(&root.id);
        root.id = id.to_string();
        self.tokens.insert(root.id.clone(), root);
    }

    fn allowed(&self, token: &TokenEntry, path: &str, method: RequestMethod) -> bool {
        if token.is_root() {
            return true;
        }
        let wanted: &[&str] = match method {
            RequestMethod::Get => &["read"],
            RequestMethod::List => &["list"],
            RequestMethod::Delete => &["delete"],
            RequestMethod::Put | RequestMethod::Post => &["create", "update"],
        };
        token
            .policies
            .iter()
            .filter_map(|name| self.policies.get(name))
            .flat_map(|policy| policy.rules.iter())
            .filter(|rule| rule.matches(path))
            .any(|rule| {
                rule.capabilities
                    .iter()
                    .any(|c| c == "sudo" || wanted.contains(&c.as_str()))
            })
    }

    fn handle(&mut self, request: BackendRequest) -> BackendResponse {
        let path = request
            .path
            .trim_start_matches("/v1/")
            .trim_end_matches('/')
            .to_string();
        let method = request.method;
        let body = request.body.unwrap_or_else(|| json!({}));

        match path.as_str() {
            "sys/health" => return self.health(),
            "sys/seal-status" => return self.seal_status(),
            "sys/init" => return self.init(&body),
            "sys/unseal" => return self.unseal(&body),
            "sys/generate-root/attempt" => return self.root_attempt(method),
            "sys/generate-root/update" => return self.root_update(&body),
            _ => {}
        }

        if !self.initialized || self.sealed {
            return error(503, "Vault is sealed");
        }

        if let Some(rest) = path.strip_prefix("auth/") {
            if let Some((mount, user)) = rest.split_once("/login/") {
                return self.login(mount, user, &body);
            }
        }

        let token = match request.token.as_deref().and_then(|t| self.tokens.get(t)) {
            Some(entry) => entry.clone(),
            None => return permission_denied(),
        };
        if !self.allowed(&token, &path, method) {
            return permission_denied();
        }

        let segments: Vec<&str> = path.split('/').collect();
        match segments.as_slice() {
            ["sys", "mounts"] => ok(self.mount_table(false)),
            ["sys", "mounts", name] => self.enable_mount(false, name, &body),
            ["sys", "auth"] => ok(self.mount_table(true)),
            ["sys", "auth", name] => self.enable_mount(true, name, &body),
            ["sys", "policies", "acl", name] => self.policy(method, name, &body),
            ["auth", "token", operation] => self.token_operation(method, operation, &token, &body),
            ["auth", mount, "users", user] => self.user(method, mount, user, &body),
            ["identity", ..] => self.identity(method, &segments[1..], &token, &body),
            [mount, rest @ ..] => self.engine(method, mount, rest, &body),
            [] => not_found(),
        }
    }

    fn health(&self) -> BackendResponse {
        let status = if !self.initialized {
            501
        } else if self.sealed {
            503
        } else if self.standby {
            429
        } else {
            200
        };
        BackendResponse::new(
            status,
            json!({
                "initialized": self.initialized,
                "sealed": self.sealed,
                "standby": self.standby,
            }),
        )
    }

    fn seal_status(&self) -> BackendResponse {
        ok(json!({
            "type": "shamir",
            "initialized": self.initialized,
            "sealed": !self.initialized || self.sealed,
            "t": self.threshold,
            "n": self.shares.len(),
            "progress": self.unseal_progress.len(),
            "nonce": "",
        }))
    }

    fn init(&mut self, body: &Value) -> BackendResponse {
        if self.initialized {
            return error(400, "Vault is already initialized");
        }
        let shares = body.get("secret_shares").and_then(Value::as_u64).unwrap_or(0) as usize;
        let threshold = body
            .get("secret_threshold")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if shares == 0 || threshold == 0 || threshold > shares {
            return error(400, "invalid seal configuration");
        }

        self.shares = (0..shares)
            .map(|_| {
                let mut share = Uuid::new_v4().as_bytes().to_vec();
                share.extend_from_slice(Uuid::new_v4().as_bytes());
                share
            })
            .collect();
        self.threshold = threshold;
        self.initialized = true;
        self.sealed = true;
        let root = format!("hvs.{}", random_hex(32));
        self.insert_root(&root);

        ok(json!({
            "keys": self.shares.iter().map(|s| to_hex(s)).collect::<Vec<_>>(),
            "keys_base64": self.shares.iter().map(|s| STANDARD.encode(s)).collect::<Vec<_>>(),
            "root_token": root,
        }))
    }

    fn unseal_json(&self) -> Value {
        json!({
            "sealed": self.sealed,
            "t": self.threshold,
            "n": self.shares.len(),
            "progress": self.unseal_progress.len(),
        })
    }

    fn unseal(&mut self, body: &Value) -> BackendResponse {
        if !self.initialized {
            return error(400, "Vault is not initialized");
        }
        if body.get("reset").and_then(Value::as_bool) == Some(true) {
            self.unseal_progress.clear();
            return ok(self.unseal_json());
        }
        if !self.sealed {
            return ok(self.unseal_json());
        }
        let share = match body.get("key").and_then(Value::as_str).map(decode_share) {
            Some(Ok(share)) if self.shares.contains(&share) => share,
            _ => return error(400, "invalid key"),
        };
        self.unseal_progress.insert(share);
        if self.unseal_progress.len() >= self.threshold {
            self.sealed = false;
            self.unseal_progress.clear();
        }
        ok(self.unseal_json())
    }

    fn root_attempt(&mut self, method: RequestMethod) -> BackendResponse {
        if !self.initialized || self.sealed {
            return error(503, "Vault is sealed");
        }
        match method {
            RequestMethod::Delete => {
                self.root_generation = None;
                no_content()
            }
            RequestMethod::Put | RequestMethod::Post => {
                if self.root_generation.is_some() {
                    return error(400, "root generation already in progress");
                }
                let generation = RootGeneration {
                    nonce: Uuid::new_v4().to_string(),
                    otp: random_hex(36),
                    progress: HashSet::new(),
                };
                let body = json!({
                    "started": true,
                    "nonce": generation.nonce,
                    "otp": generation.otp,
                    "otp_length": generation.otp.len(),
                    "progress": 0,
                    "required": self.threshold,
                    "complete": false,
                });
                self.root_generation = Some(generation);
                ok(body)
            }
            _ => ok(json!({
                "started": self.root_generation.is_some(),
                "required": self.threshold,
                "progress": self.root_generation.as_ref().map_or(0, |g| g.progress.len()),
            })),
        }
    }

    fn root_update(&mut self, body: &Value) -> BackendResponse {
        if !self.initialized || self.sealed {
            return error(503, "Vault is sealed");
        }
        let share = match body.get("key").and_then(Value::as_str).map(decode_share) {
            Some(Ok(share)) if self.shares.contains(&share) => share,
            _ => return error(400, "invalid key"),
        };
        let nonce = body.get("nonce").and_then(Value::as_str).unwrap_or_default();
        let threshold = self.threshold;
        let Some(generation) = self.root_generation.as_mut() else {
            return error(400, "no root generation in progress");
        };
        if generation.nonce != nonce {
            return error(400, "incorrect nonce");
        }
        generation.progress.insert(share);
        let progress = generation.progress.len();
        if progress < threshold {
            return ok(json!({
                "complete": false,
                "progress": progress,
                "required": threshold,
                "nonce": nonce,
            }));
        }

        let otp = generation.otp.clone();
        self.root_generation = None;
        self.tokens.retain(|_, entry| !entry.is_root());
        let root = format!("hvs.{}", random_hex(32));
        self.insert_root(&root);
        let encoded: Vec<u8> = root
            .bytes()
            .zip(otp.bytes())
            .map(|(t, o)| t ^ o)
            .collect();
        ok(json!({
            "complete": true,
            "progress": progress,
            "required": threshold,
            "encoded_token": STANDARD.encode(encoded),
        }))
    }

    fn mount_table(&self, auth: bool) -> Value {
        let table = if auth { &self.auth_mounts } else { &self.mounts };
        let rows: Map<String, Value> = table
            .iter()
            .map(|(name, mount)| (name.clone(), mount.to_json()))
            .collect();
        json!({ "data": rows })
    }

    fn enable_mount(&mut self, auth: bool, name: &str, body: &Value) -> BackendResponse {
        let key = format!("{}/", name);
        let table = if auth { &self.auth_mounts } else { &self.mounts };
        if table.contains_key(&key) {
            return error(400, &format!("path is already in use at {}", key));
        }
        let Some(engine) = body.get("type").and_then(Value::as_str) else {
            return error(400, "missing type");
        };
        let accessor = if auth {
            new_accessor(&format!("auth_{}", engine))
        } else {
            new_accessor(engine)
        };
        let mut mount = Mount::new(engine, accessor);
        mount.options = body.get("options").and_then(Value::as_object).map(|options| {
            options
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map_or_else(|| v.to_string(), str::to_string)))
                .collect()
        });
        if engine == "kv" && mount.options.is_none() {
            mount.options = Some(HashMap::from([("version".to_string(), "1".to_string())]));
        }
        mount.default_lease_ttl = body
            .get("config")
            .and_then(|config| ttl_field(config, "default_lease_ttl"))
            .unwrap_or(0);

        if auth {
            self.auth_mounts.insert(key, mount);
        } else {
            if engine == "consul" {
                self.consul.insert(name.to_string(), ConsulEngine::default());
            }
            self.mounts.insert(key, mount);
        }
        no_content()
    }

    fn policy(&mut self, method: RequestMethod, name: &str, body: &Value) -> BackendResponse {
        match method {
            RequestMethod::Get => match self.policies.get(name) {
                Some(policy) => ok(json!({ "data": { "name": name, "policy": policy.document } })),
                None => not_found(),
            },
            RequestMethod::Delete => {
                self.policies.remove(name);
                no_content()
            }
            _ => match body.get("policy").and_then(Value::as_str) {
                Some(document) => {
                    self.policies.insert(name.to_string(), parse_policy(document));
                    no_content()
                }
                None => error(400, "'policy' parameter not supplied or empty"),
            },
        }
    }

    fn token_operation(
        &mut self,
        method: RequestMethod,
        operation: &str,
        caller: &TokenEntry,
        body: &Value,
    ) -> BackendResponse {
        match (method, operation) {
            (RequestMethod::Get, "lookup-self") => ok(json!({ "data": caller.lookup_json() })),
            (RequestMethod::Post | RequestMethod::Put, "revoke-self") => {
                self.tokens.remove(&caller.id);
                no_content()
            }
            (RequestMethod::Post | RequestMethod::Put, "create") => self.create_token(caller, body),
            (RequestMethod::List, "accessors") => {
                let keys: BTreeSet<&String> = self.tokens.values().map(|t| &t.accessor).collect();
                ok(json!({ "data": { "keys": keys } }))
            }
            (RequestMethod::Post | RequestMethod::Put, "lookup-accessor") => {
                let accessor = body.get("accessor").and_then(Value::as_str).unwrap_or_default();
                match self.tokens.values().find(|t| t.accessor == accessor) {
                    Some(entry) => ok(json!({ "data": entry.lookup_json() })),
                    None => error(400, "invalid accessor"),
                }
            }
            (RequestMethod::Post | RequestMethod::Put, "revoke-accessor") => {
                let accessor = body.get("accessor").and_then(Value::as_str).unwrap_or_default();
                let before = self.tokens.len();
                self.tokens.retain(|_, t| t.accessor != accessor);
                if self.tokens.len() == before {
                    return error(400, "invalid accessor");
                }
                no_content()
            }
            _ => not_found(),
        }
    }

    fn create_token(&mut self, caller: &TokenEntry, body: &Value) -> BackendResponse {
        let policies = str_list(body, "policies").unwrap_or_else(|| caller.policies.clone());
        if !caller.is_root()
            && policies
                .iter()
                .any(|p| p != "default" && !caller.policies.contains(p))
        {
            return error(400, "child policies must be subset of parent");
        }
        let period = ttl_field(body, "period");
        let ttl = ttl_field(body, "ttl").or(period).unwrap_or(DEFAULT_TOKEN_TTL);
        let display_name = body
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or("token");
        let mut entry = self.mint_token(policies, "", ttl, display_name, "auth/token/create");
        entry.period = period;
        entry.renewable = body.get("renewable").and_then(Value::as_bool).unwrap_or(true);
        if let Some(Value::Object(meta)) = body.get("meta") {
            entry.meta = meta.clone();
        }
        self.tokens.insert(entry.id.clone(), entry.clone());
        ok(json!({ "auth": entry.auth_json() }))
    }

    fn userpass_mount(&self, mount: &str) -> Option<&Mount> {
        self.auth_mounts
            .get(&format!("{}/", mount))
            .filter(|m| m.engine == "userpass")
    }

    fn user(&mut self, method: RequestMethod, mount: &str, user: &str, body: &Value) -> BackendResponse {
        if self.userpass_mount(mount).is_none() {
            return not_found();
        }
        let key = (mount.to_string(), user.to_string());
        match method {
            RequestMethod::Delete => {
                self.users.remove(&key);
                no_content()
            }
            RequestMethod::Post | RequestMethod::Put => {
                let password = body.get("password").and_then(Value::as_str).unwrap_or_default();
                if password.is_empty() && !self.users.contains_key(&key) {
                    return error(400, "missing password");
                }
                let entry = self.users.entry(key).or_insert_with(|| User {
                    password: String::new(),
                    token_ttl: DEFAULT_TOKEN_TTL,
                    policies: Vec::new(),
                });
                if !password.is_empty() {
                    entry.password = password.to_string();
                }
                if let Some(ttl) = ttl_field(body, "token_ttl") {
                    entry.token_ttl = ttl;
                }
                if let Some(policies) = str_list(body, "token_policies") {
                    entry.policies = policies;
                }
                no_content()
            }
            _ => not_found(),
        }
    }

    fn login(&mut self, mount: &str, username: &str, body: &Value) -> BackendResponse {
        let Some(accessor) = self.userpass_mount(mount).map(|m| m.accessor.clone()) else {
            return not_found();
        };
        let password = body.get("password").and_then(Value::as_str).unwrap_or_default();
        let (ttl, policies) = match self.users.get(&(mount.to_string(), username.to_string())) {
            Some(user) if user.password == password => (user.token_ttl, user.policies.clone()),
            _ => return error(400, "invalid username or password"),
        };
        let entity_id = self
            .aliases
            .get(&(accessor, username.to_string()))
            .cloned()
            .unwrap_or_default();
        let mut entry = self.mint_token(
            policies,
            &entity_id,
            ttl,
            &format!("{}-{}", mount, username),
            &format!("auth/{}/login/{}", mount, username),
        );
        entry
            .meta
            .insert("username".to_string(), json!(username));
        self.tokens.insert(entry.id.clone(), entry.clone());
        ok(json!({ "auth": entry.auth_json() }))
    }

    fn entity_json(&self, id: &str, entity: &Entity) -> Value {
        let aliases: Vec<Value> = self
            .aliases
            .iter()
            .filter(|(_, entity_id)| entity_id.as_str() == id)
            .map(|((accessor, name), _)| json!({ "name": name, "mount_accessor": accessor }))
            .collect();
        json!({
            "data": {
                "id": id,
                "name": entity.name,
                "metadata": entity.metadata,
                "policies": entity.policies,
                "aliases": aliases,
            }
        })
    }

    fn entity_id_by_name(&self, name: &str) -> Option<String> {
        self.entities
            .iter()
            .find(|(_, entity)| entity.name == name)
            .map(|(id, _)| id.clone())
    }

    fn create_entity(&mut self, name: &str, metadata: Value, policies: Value) -> String {
        let id = Uuid::new_v4().to_string();
        self.entities.insert(
            id.clone(),
            Entity {
                name: name.to_string(),
                metadata,
                policies,
            },
        );
        id
    }

    fn delete_entity(&mut self, id: &str) {
        self.entities.remove(id);
        self.aliases.retain(|_, entity_id| entity_id.as_str() != id);
    }

    fn identity(
        &mut self,
        method: RequestMethod,
        segments: &[&str],
        caller: &TokenEntry,
        body: &Value,
    ) -> BackendResponse {
        match (method, segments) {
            (RequestMethod::Post | RequestMethod::Put, ["entity"]) => {
                let Some(name) = body.get("name").and_then(Value::as_str) else {
                    return error(400, "missing name");
                };
                let metadata = body.get("metadata").cloned().unwrap_or(Value::Null);
                let policies = body.get("policies").cloned().unwrap_or(json!([]));
                match self.entity_id_by_name(name) {
                    Some(id) => {
                        if let Some(entity) = self.entities.get_mut(&id) {
                            entity.metadata = metadata;
                            entity.policies = policies;
                        }
                        no_content()
                    }
                    None => {
                        let id = self.create_entity(name, metadata, policies);
                        ok(json!({ "data": { "id": id, "name": name } }))
                    }
                }
            }
            (_, ["entity", "name", name]) => {
                let Some(id) = self.entity_id_by_name(name) else {
                    return match method {
                        RequestMethod::Delete => no_content(),
                        _ => not_found(),
                    };
                };
                self.entity_by_id(method, &id)
            }
            (_, ["entity", "id", id]) => {
                if !self.entities.contains_key(*id) {
                    return not_found();
                }
                self.entity_by_id(method, id)
            }
            (RequestMethod::Post | RequestMethod::Put, ["entity-alias"]) => self.entity_alias(body),
            (RequestMethod::List, ["oidc", "key"]) => {
                if self.oidc_keys.is_empty() {
                    return not_found();
                }
                let keys: Vec<&String> = self.oidc_keys.keys().collect();
                ok(json!({ "data": { "keys": keys } }))
            }
            (_, ["oidc", "key", name]) => self.oidc_key(method, name, body),
            (RequestMethod::Post | RequestMethod::Put, ["oidc", "role", name]) => {
                let key = body.get("key").and_then(Value::as_str).unwrap_or_default();
                if !self.oidc_keys.contains_key(key) {
                    return error(400, &format!("key \"{}\" does not exist", key));
                }
                let ttl = ttl_field(body, "ttl").unwrap_or(86400);
                let client_id = self
                    .oidc_roles
                    .get(*name)
                    .map(|role| role.client_id.clone())
                    .unwrap_or_else(|| random_hex(22));
                self.oidc_roles.insert(
                    name.to_string(),
                    OidcRole {
                        key: key.to_string(),
                        ttl,
                        client_id,
                    },
                );
                no_content()
            }
            (RequestMethod::Get, ["oidc", "token", role]) => self.issue_jwt(caller, role),
            (RequestMethod::Post | RequestMethod::Put, ["oidc", "introspect"]) => {
                self.introspect(body)
            }
            _ => not_found(),
        }
    }

    fn entity_by_id(&mut self, method: RequestMethod, id: &str) -> BackendResponse {
        match method {
            RequestMethod::Delete => {
                self.delete_entity(id);
                no_content()
            }
            _ => match self.entities.get(id) {
                Some(entity) => ok(self.entity_json(id, entity)),
                None => not_found(),
            },
        }
    }

    fn entity_alias(&mut self, body: &Value) -> BackendResponse {
        let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
        let canonical = body.get("canonical_id").and_then(Value::as_str).unwrap_or_default();
        let accessor = body.get("mount_accessor").and_then(Value::as_str).unwrap_or_default();
        if !self.entities.contains_key(canonical) {
            return error(400, "entity not found");
        }
        if !self.auth_mounts.values().any(|m| m.accessor == accessor) {
            return error(400, "invalid mount accessor");
        }
        let key = (accessor.to_string(), name.to_string());
        match self.aliases.get(&key) {
            Some(existing) if existing != canonical => {
                error(400, "alias already tied to a different entity")
            }
            _ => {
                self.aliases.insert(key, canonical.to_string());
                ok(json!({ "data": { "canonical_id": canonical, "id": random_hex(32) } }))
            }
        }
    }

    fn oidc_key(&mut self, method: RequestMethod, name: &str, body: &Value) -> BackendResponse {
        match method {
            RequestMethod::Get => match self.oidc_keys.get(name) {
                Some(key) => ok(json!({
                    "data": {
                        "algorithm": key.algorithm,
                        "allowed_client_ids": ["*"],
                        "rotation_period": 86400,
                        "verification_ttl": 86400,
                    }
                })),
                None => not_found(),
            },
            RequestMethod::Delete => {
                self.oidc_keys.remove(name);
                no_content()
            }
            _ => {
                let algorithm = body
                    .get("algorithm")
                    .and_then(Value::as_str)
                    .unwrap_or("RS256")
                    .to_string();
                let secret = self
                    .oidc_keys
                    .remove(name)
                    .map(|key| key.secret)
                    .unwrap_or_else(|| random_hex(64).into_bytes());
                self.oidc_keys
                    .insert(name.to_string(), OidcKey { algorithm, secret });
                no_content()
            }
        }
    }

    // Tokens are HS256 signed whatever the key's nominal algorithm
    fn issue_jwt(&self, caller: &TokenEntry, role_name: &str) -> BackendResponse {
        if caller.entity_id.is_empty() {
            return error(400, "no entity associated with the request's token");
        }
        let Some(role) = self.oidc_roles.get(role_name) else {
            return error(400, &format!("role \"{}\" not found", role_name));
        };
        let Some(key) = self.oidc_keys.get(&role.key) else {
            return error(400, &format!("key \"{}\" not found", role.key));
        };
        let issued = now();
        let claims = json!({
            "iss": "http://127.0.0.1:8200/v1/identity/oidc",
            "sub": caller.entity_id,
            "aud": role.client_id,
            "iat": issued,
            "exp": issued + role.ttl,
            "namespace": "root",
        });
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(role.key.clone());
        match jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(&key.secret)) {
            Ok(token) => ok(json!({
                "data": { "token": token, "client_id": role.client_id, "ttl": role.ttl }
            })),
            Err(e) => error(500, &e.to_string()),
        }
    }

    fn introspect(&self, body: &Value) -> BackendResponse {
        let inactive = |reason: &str| {
            BackendResponse::new(400, json!({ "active": false, "errors": [reason] }))
        };
        let token = body.get("token").and_then(Value::as_str).unwrap_or_default();
        let Ok(header) = jsonwebtoken::decode_header(token) else {
            return inactive("error parsing token");
        };
        let Some(key) = header.kid.as_deref().and_then(|kid| self.oidc_keys.get(kid)) else {
            return inactive("unknown signing key");
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        match jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&key.secret), &validation) {
            Ok(_) => ok(json!({ "active": true })),
            Err(e) => inactive(&format!("error validating signature: {}", e)),
        }
    }

    fn engine(&mut self, method: RequestMethod, mount: &str, rest: &[&str], body: &Value) -> BackendResponse {
        let engine = match self.mounts.get(&format!("{}/", mount)) {
            Some(m) if m.engine == "kv" && m.is_kv2() => "kv2",
            Some(m) if m.engine == "kv" => "kv1",
            Some(m) if m.engine == "consul" => "consul",
            _ => return error(404, "no handler for route"),
        };
        match engine {
            "kv1" => self.kv1(method, mount, &rest.join("/"), body),
            "kv2" => match rest.split_first() {
                Some((&"data", path)) => self.kv2_data(method, mount, &path.join("/"), body),
                Some((&"metadata", path)) if method == RequestMethod::List => {
                    self.kv_list(mount, &path.join("/"))
                }
                _ => not_found(),
            },
            _ => self.consul_engine(method, mount, rest, body),
        }
    }

    fn kv_list(&self, mount: &str, prefix: &str) -> BackendResponse {
        match self.kv.get(mount) {
            Some(entries) => list_children(entries.keys(), prefix),
            None => not_found(),
        }
    }

    fn kv1(&mut self, method: RequestMethod, mount: &str, path: &str, body: &Value) -> BackendResponse {
        match method {
            RequestMethod::List => self.kv_list(mount, path),
            RequestMethod::Get => match self.kv.get(mount).and_then(|e| e.get(path)) {
                Some(entry) => ok(json!({ "data": entry.data })),
                None => not_found(),
            },
            RequestMethod::Delete => {
                if let Some(entries) = self.kv.get_mut(mount) {
                    entries.remove(path);
                }
                no_content()
            }
            RequestMethod::Post | RequestMethod::Put => {
                let Some(data) = body.as_object() else {
                    return error(400, "data must be an object");
                };
                self.write_entry(mount, path, data.clone());
                no_content()
            }
        }
    }

    fn kv2_data(&mut self, method: RequestMethod, mount: &str, path: &str, body: &Value) -> BackendResponse {
        match method {
            RequestMethod::Get => match self.kv.get(mount).and_then(|e| e.get(path)) {
                // A deleted latest version answers 404 but keeps its metadata
                Some(entry) if entry.deletion_time.is_some() => BackendResponse::new(
                    404,
                    json!({
                        "data": {
                            "data": null,
                            "metadata": {
                                "version": entry.version,
                                "deletion_time": entry.deletion_time,
                                "destroyed": false,
                            },
                        }
                    }),
                ),
                Some(entry) => ok(json!({
                    "data": {
                        "data": entry.data,
                        "metadata": { "version": entry.version, "deletion_time": "", "destroyed": false },
                    }
                })),
                None => not_found(),
            },
            RequestMethod::Delete => {
                self.soft_delete_entry(mount, path);
                no_content()
            }
            RequestMethod::Post | RequestMethod::Put => {
                let Some(data) = body.get("data").and_then(Value::as_object) else {
                    return error(400, "no data provided");
                };
                let current = self
                    .kv
                    .get(mount)
                    .and_then(|e| e.get(path))
                    .map_or(0, |entry| entry.version);
                if let Some(cas) = body.pointer("/options/cas").and_then(Value::as_u64) {
                    if cas != current {
                        return error(400, "check-and-set parameter did not match the current version");
                    }
                }
                let version = self.write_entry(mount, path, data.clone());
                ok(json!({ "data": { "version": version } }))
            }
            RequestMethod::List => not_found(),
        }
    }

    fn write_entry(&mut self, mount: &str, path: &str, data: Map<String, Value>) -> u64 {
        let entries = self.kv.entry(mount.to_string()).or_default();
        let version = entries.get(path).map_or(0, |entry| entry.version) + 1;
        entries.insert(
            path.to_string(),
            KvEntry {
                data,
                version,
                deletion_time: None,
            },
        );
        version
    }

    fn soft_delete_entry(&mut self, mount: &str, path: &str) {
        if let Some(entry) = self.kv.get_mut(mount).and_then(|e| e.get_mut(path)) {
            entry.data = Map::new();
            entry.deletion_time = Some(now().to_string());
        }
    }

    fn consul_engine(&mut self, method: RequestMethod, mount: &str, rest: &[&str], body: &Value) -> BackendResponse {
        let engine = self.consul.entry(mount.to_string()).or_default();
        match (method, rest) {
            (RequestMethod::Post | RequestMethod::Put, ["config", "access"]) => {
                let address = body.get("address").and_then(Value::as_str).unwrap_or_default();
                let token = body.get("token").and_then(Value::as_str).unwrap_or_default();
                if address.is_empty() || token.is_empty() {
                    return error(400, "address and token are required");
                }
                engine.access = Some((address.to_string(), token.to_string()));
                no_content()
            }
            (RequestMethod::Post | RequestMethod::Put, ["roles", name]) => {
                engine.roles.insert(name.to_string(), body.clone());
                no_content()
            }
            (RequestMethod::Get, ["roles", name]) => match engine.roles.get(*name) {
                Some(role) => ok(json!({ "data": role })),
                None => not_found(),
            },
            (RequestMethod::Get, ["creds", name]) => {
                if engine.access.is_none() {
                    return error(400, "no access configured");
                }
                if !engine.roles.contains_key(*name) {
                    return error(400, &format!("role \"{}\" not found", name));
                }
                ok(json!({
                    "lease_id": format!("{}/creds/{}/{}", mount, name, random_hex(24)),
                    "lease_duration": 3600,
                    "data": {
                        "token": Uuid::new_v4().to_string(),
                        "accessor": Uuid::new_v4().to_string(),
                    }
                }))
            }
            _ => not_found(),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// A backend that has never been initialized.
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .policies
            .insert("default".to_string(), parse_policy(DEFAULT_POLICY));
        state.mounts.insert("sys/".to_string(), Mount::new("system", new_accessor("system")));
        state
            .mounts
            .insert("identity/".to_string(), Mount::new("identity", new_accessor("identity")));
        state
            .auth_mounts
            .insert("token/".to_string(), Mount::new("token", new_accessor("auth_token")));
        Self {
            state: Mutex::new(state),
        }
    }

    /// An initialized, unsealed backend with root token `root`, a KV v1
    /// engine at `secret/` and a KV v2 engine at `kv/`.
    pub fn dev() -> Self {
        let backend = Self::new();
        {
            let mut state = backend.lock();
            state.initialized = true;
            state.sealed = false;
            state.threshold = 1;
            state.shares = vec![Uuid::new_v4().as_bytes().to_vec()];
            state.insert_root("root");
            state.mounts.insert("secret/".to_string(), Mount::kv("1"));
            state.mounts.insert("kv/".to_string(), Mount::kv("2"));
        }
        backend
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a token with `policies`, optionally tied to an entity.
    pub fn issue_token(&self, policies: &[&str], entity_id: Option<&str>) -> String {
        let policies = policies.iter().map(|p| p.to_string()).collect();
        self.lock()
            .mint_token(
                policies,
                entity_id.unwrap_or_default(),
                DEFAULT_TOKEN_TTL,
                "test",
                "auth/token/create",
            )
            .id
    }

    pub fn put_policy(&self, name: &str, document: &str) {
        self.lock()
            .policies
            .insert(name.to_string(), parse_policy(document));
    }

    pub fn has_policy(&self, name: &str) -> bool {
        self.lock().policies.contains_key(name)
    }

    /// Writes secrets directly, bypassing policies.
    pub fn write_kv(&self, mount: &str, path: &str, pairs: &[(&str, &str)]) {
        let data = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        self.lock().write_entry(mount, path, data);
    }

    /// Writes a raw JSON object as secret data, bypassing policies.
    pub fn write_kv_json(&self, mount: &str, path: &str, data: Value) {
        let data = data.as_object().cloned().unwrap_or_default();
        self.lock().write_entry(mount, path, data);
    }

    /// Soft deletes the latest version of a KV v2 secret, as
    /// `DELETE <mount>/data/<path>` does.
    pub fn delete_kv_latest(&self, mount: &str, path: &str) {
        self.lock().soft_delete_entry(mount, path);
    }

    /// Mounts and configures a Consul engine serving `roles`.
    pub fn enable_consul(&self, mount: &str, roles: &[&str]) {
        let mut state = self.lock();
        let mut consul = Mount::new("consul", new_accessor("consul"));
        consul.default_lease_ttl = 3600;
        state.mounts.insert(format!("{}/", mount), consul);
        let engine = state.consul.entry(mount.to_string()).or_default();
        engine.access = Some(("127.0.0.1:8500".to_string(), "bootstrap".to_string()));
        for role in roles {
            engine
                .roles
                .insert(role.to_string(), json!({ "token_type": "client" }));
        }
    }

    /// Creates the signing key (if missing) and an OIDC role using it.
    pub fn create_oidc_role(&self, role: &str, key: &str, ttl_secs: u64) {
        let mut state = self.lock();
        state.oidc_keys.entry(key.to_string()).or_insert_with(|| OidcKey {
            algorithm: "RS256".to_string(),
            secret: random_hex(64).into_bytes(),
        });
        state.oidc_roles.insert(
            role.to_string(),
            OidcRole {
                key: key.to_string(),
                ttl: ttl_secs,
                client_id: random_hex(22),
            },
        );
    }

    pub fn create_entity(&self, name: &str) -> String {
        self.lock().create_entity(name, Value::Null, json!([]))
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn set_standby(&self, standby: bool) {
        self.lock().standby = standby;
    }

    pub fn seal(&self) {
        let mut state = self.lock();
        state.sealed = true;
        state.unseal_progress.clear();
    }

    pub fn is_root_token(&self, token: &str) -> bool {
        self.lock().tokens.get(token).is_some_and(TokenEntry::is_root)
    }
}

#[async_trait]
impl Transport for InMemoryBackend {
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, SecretsError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(SecretsError::Unreachable(format!(
                "connection refused: {}",
                request.path
            )));
        }
        Ok(state.handle(request))
    }
}
