//! In-process backend and name service speaking the [`JsonCodec`] format.
//!
//! Every deployed artifact gets a key/value store. Calls are interpreted by
//! method name:
//!
//! - `register(name, address)` / `lookup(name)` implement the hub directory;
//! - `get*` reads a property, everything else writes its first argument to one;
//! - the property is the method name with its leading `_` and any
//!   `set`/`accept`/`transfer`/`get` prefix removed, lowercased, and with a
//!   trailing `ownership` shortened to `owner`. So `acceptDatabase` pairs with
//!   `getDatabase` and `transferOwnership` with `getOwner`.
//!
//! Named constructor arguments are stored the same way, so a module built
//! with `_hub = <addr>` answers `getHub`. Faults can be injected to exercise
//! failure paths, and every call is recorded in a trace.

use crate::core::address::Address;
use crate::core::backend::{Backend, BackendError, Connection, DeployPayload, NameService};
use crate::core::codec::{JsonCodec, Word};
use crate::core::registry::{LOOKUP_METHOD, REGISTER_METHOD};
use futures::FutureExt;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Something the simulator observed, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Deploy {
        address: Address,
        code: Vec<u8>,
        constructor: Vec<(Option<String>, Word)>,
    },
    Invoke {
        address: Address,
        method: String,
        args: Vec<Word>,
        read_only: bool,
    },
    Publish {
        name: String,
        value: String,
    },
}

/// Failure injected into the simulator. Artifacts are matched by a prefix of
/// their linked code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    RejectDeploy { code_prefix: Vec<u8> },
    /// Answer `method` with `value` instead of the stored property.
    OverrideRead {
        code_prefix: Vec<u8>,
        method: String,
        value: Word,
    },
    DelayDeploy { code_prefix: Vec<u8>, millis: u64 },
    RejectPublish,
}

struct Account {
    code: Vec<u8>,
    storage: BTreeMap<String, Word>,
}

#[derive(Default)]
struct SimState {
    nonce: u64,
    accounts: BTreeMap<Address, Account>,
    names: BTreeMap<String, String>,
    trace: Vec<SimEvent>,
    faults: Vec<Fault>,
}

#[derive(Default)]
pub struct SimChain {
    state: Mutex<SimState>,
}

impl SimChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fault(self, fault: Fault) -> Self {
        self.inject(fault);
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    /// A [`Connection`] whose backend and name service are both this simulator.
    pub fn connection(self: &Arc<Self>) -> Connection {
        Connection::new(self.clone(), self.clone(), Arc::new(JsonCodec))
    }

    pub fn trace(&self) -> Vec<SimEvent> {
        self.lock().trace.clone()
    }

    pub fn deployed(&self) -> usize {
        self.lock().accounts.len()
    }

    pub fn code_at(&self, address: Address) -> Option<Vec<u8>> {
        self.lock().accounts.get(&address).map(|a| a.code.clone())
    }

    /// Raw property of a deployed artifact, bypassing faults.
    pub fn property(&self, address: Address, key: &str) -> Option<Word> {
        self.lock()
            .accounts
            .get(&address)
            .and_then(|a| a.storage.get(key).cloned())
    }

    pub fn published(&self, name: &str) -> Option<String> {
        self.lock().names.get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deploy_delay(&self, code: &[u8]) -> Option<Duration> {
        self.lock().faults.iter().find_map(|f| match f {
            Fault::DelayDeploy { code_prefix, millis } if code.starts_with(code_prefix) => {
                Some(Duration::from_millis(*millis))
            }
            _ => None,
        })
    }

    fn deploy_now(&self, payload: DeployPayload) -> Result<Address, BackendError> {
        let mut state = self.lock();
        if payload.code.is_empty() {
            return Err(BackendError::new("empty code"));
        }
        let rejected = state.faults.iter().any(|f| {
            matches!(f, Fault::RejectDeploy { code_prefix } if payload.code.starts_with(code_prefix))
        });
        if rejected {
            return Err(BackendError::new("deployment rejected by backend"));
        }

        let args = JsonCodec::decode_constructor(&payload.constructor)
            .map_err(|e| BackendError::new(format!("bad constructor input: {}", e)))?;

        state.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"keystone-sim");
        hasher.update(state.nonce.to_be_bytes());
        let digest = hasher.finalize();
        let address = Address::from_bytes(&digest[..Address::LEN])
            .map_err(|e| BackendError::new(e.to_string()))?;

        let mut storage = BTreeMap::new();
        for (i, arg) in args.iter().enumerate() {
            let key = match &arg.name {
                Some(name) => property_key(name),
                None => format!("arg{}", i),
            };
            storage.insert(key, arg.value.clone());
        }

        state.accounts.insert(
            address,
            Account {
                code: payload.code.clone(),
                storage,
            },
        );
        state.trace.push(SimEvent::Deploy {
            address,
            code: payload.code,
            constructor: args.into_iter().map(|a| (a.name, a.value)).collect(),
        });
        trace!(address = %address, "sim deploy");
        Ok(address)
    }

    fn invoke_now(
        &self,
        address: Address,
        payload: &[u8],
        read_only: bool,
    ) -> Result<Vec<u8>, BackendError> {
        let call = JsonCodec::decode_call(payload).map_err(|e| BackendError::new(e.to_string()))?;
        let args: Vec<Word> = call.args.iter().map(|a| a.value.clone()).collect();

        let mut guard = self.lock();
        let state = &mut *guard;
        state.trace.push(SimEvent::Invoke {
            address,
            method: call.method.clone(),
            args: args.clone(),
            read_only,
        });

        let account = state
            .accounts
            .get_mut(&address)
            .ok_or_else(|| BackendError::new(format!("no artifact at {}", address)))?;

        let result = if call.method == LOOKUP_METHOD {
            let name = text_arg(&args, 0, &call.method)?;
            account
                .storage
                .get(&format!("name:{}", name))
                .cloned()
                .unwrap_or(Word::Null)
        } else if call.method == REGISTER_METHOD {
            if read_only {
                return Err(BackendError::new("register is not a read-only call"));
            }
            let name = text_arg(&args, 0, &call.method)?;
            let value = args
                .get(1)
                .cloned()
                .ok_or_else(|| BackendError::new("register needs an address"))?;
            account.storage.insert(format!("name:{}", name), value);
            Word::Null
        } else if call.method.starts_with("get") {
            let overridden = state.faults.iter().find_map(|f| match f {
                Fault::OverrideRead {
                    code_prefix,
                    method,
                    value,
                } if *method == call.method && account.code.starts_with(code_prefix) => {
                    Some(value.clone())
                }
                _ => None,
            });
            match overridden {
                Some(value) => value,
                None => account
                    .storage
                    .get(&property_key(&call.method))
                    .cloned()
                    .unwrap_or(Word::Null),
            }
        } else {
            if read_only {
                return Err(BackendError::new(format!(
                    "{} mutates state and cannot be called read-only",
                    call.method
                )));
            }
            let value = args.first().cloned().unwrap_or(Word::Null);
            account.storage.insert(property_key(&call.method), value);
            Word::Null
        };

        trace!(address = %address, method = %call.method, read_only, "sim invoke");
        if result == Word::Null && !read_only {
            return Ok(Vec::new());
        }
        JsonCodec::encode_return(&result).map_err(|e| BackendError::new(e.to_string()))
    }
}

fn text_arg<'a>(args: &'a [Word], index: usize, method: &str) -> Result<&'a str, BackendError> {
    match args.get(index) {
        Some(Word::Text(s)) => Ok(s),
        _ => Err(BackendError::new(format!(
            "{} expects a text argument at position {}",
            method, index
        ))),
    }
}

fn property_key(method: &str) -> String {
    let name = method.trim_start_matches('_');
    let name = ["set", "accept", "transfer", "get"]
        .iter()
        .find_map(|prefix| {
            name.strip_prefix(prefix)
                .filter(|rest| rest.starts_with(|c: char| c.is_ascii_uppercase()))
        })
        .unwrap_or(name);
    let lower = name.to_ascii_lowercase();
    match lower.strip_suffix("ownership") {
        Some(stem) => format!("{}owner", stem),
        None => lower,
    }
}

impl Backend for SimChain {
    fn deploy(&self, payload: DeployPayload) -> BoxFuture<'_, Result<Address, BackendError>> {
        async move {
            if let Some(delay) = self.deploy_delay(&payload.code) {
                tokio::time::sleep(delay).await;
            }
            self.deploy_now(payload)
        }
        .boxed()
    }

    fn invoke(
        &self,
        address: Address,
        payload: Vec<u8>,
        read_only: bool,
    ) -> BoxFuture<'_, Result<Vec<u8>, BackendError>> {
        async move { self.invoke_now(address, &payload, read_only) }.boxed()
    }
}

impl NameService for SimChain {
    fn publish<'a>(
        &'a self,
        name: &'a str,
        value: &'a str,
        _ttl: u64,
        _fee: u64,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        async move {
            let mut state = self.lock();
            if state.faults.contains(&Fault::RejectPublish) {
                return Err(BackendError::new("name service rejected the entry"));
            }
            state.names.insert(name.to_string(), value.to_string());
            state.trace.push(SimEvent::Publish {
                name: name.to_string(),
                value: value.to_string(),
            });
            Ok(())
        }
        .boxed()
    }

    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<String>, BackendError>> {
        async move { Ok(self.lock().names.get(name).cloned()) }.boxed()
    }
}
