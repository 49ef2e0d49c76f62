use std::{
    any::Any,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe, RefUnwindSafe},
    process::Command,
    sync::Arc,
};

use serde_json::Value;
use thiserror::Error;

use crate::{client::DeviceClient, status::Status};

/// An action execution request taken from the device mailbox.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    /// Cloud-assigned mail id, echoed back in the acknowledgement.
    pub request_id: String,
    /// Registered action name.
    pub name: String,
    /// Open key/value parameters supplied by the requester.
    pub params: Value,
}

/// Outcome of an action execution, acknowledged back to the cloud.
///
/// Conversions exist from a bare [`Status`], from `(status, message)`, and
/// from `(status, message, params)`, so callbacks can return whichever shape
/// fits.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub status: Status,
    pub message: Option<String>,
    pub params: Option<Value>,
}

impl From<Status> for ActionResult {
    fn from(status: Status) -> Self {
        ActionResult {
            status,
            message: None,
            params: None,
        }
    }
}

impl<S: Into<String>> From<(Status, S)> for ActionResult {
    fn from((status, message): (Status, S)) -> Self {
        ActionResult {
            status,
            message: Some(message.into()),
            params: None,
        }
    }
}

impl<S: Into<String>> From<(Status, S, Value)> for ActionResult {
    fn from((status, message, params): (Status, S, Value)) -> Self {
        ActionResult {
            status,
            message: Some(message.into()),
            params: Some(params),
        }
    }
}

/// Everything an action callback gets to see.
pub struct ActionContext {
    /// Handle back into the client, so a callback can publish data or start
    /// transfers of its own.
    pub client: DeviceClient,
    /// The originating request.
    pub request: ActionRequest,
    /// Data attached at registration time, if any.
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl ActionContext {
    pub fn params(&self) -> &Value {
        &self.request.params
    }
}

pub(crate) type ActionCallback =
    Arc<dyn Fn(&ActionContext) -> ActionResult + Send + Sync + RefUnwindSafe>;

/// Local behavior bound to an action name. Cheap to clone so execution can
/// happen outside the registry lock.
#[derive(Clone)]
pub(crate) enum ActionKind {
    Callback(ActionCallback),
    Command(Vec<String>),
}

impl ActionKind {
    /// Runs the action. A panicking callback is contained and reported as a
    /// plain failure; only shell commands map their exit code to
    /// [`Status::ExecutionError`].
    pub(crate) fn execute(&self, ctx: &ActionContext) -> ActionResult {
        match self {
            ActionKind::Callback(callback) => {
                match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
                    Ok(result) => result,
                    Err(_) => (
                        Status::Failure,
                        format!("action {:?} panicked", ctx.request.name),
                    )
                        .into(),
                }
            }
            ActionKind::Command(argv) => run_command(argv, ctx.params()),
        }
    }
}

struct Action {
    kind: ActionKind,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

#[derive(Debug, Error)]
pub(crate) enum RegistryError {
    #[error("action {0:?} is already registered")]
    Exists(String),
    #[error("action {0:?} is not registered")]
    NotFound(String),
}

/// Actions the cloud may invoke on this device, unique by name.
#[derive(Default)]
pub(crate) struct ActionRegistry {
    actions: HashMap<String, Action>,
}

impl ActionRegistry {
    pub(crate) fn add(
        &mut self,
        name: &str,
        kind: ActionKind,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<(), RegistryError> {
        if self.actions.contains_key(name) {
            return Err(RegistryError::Exists(name.to_owned()));
        }
        self.actions
            .insert(name.to_owned(), Action { kind, user_data });
        Ok(())
    }

    pub(crate) fn remove(&mut self, name: &str) -> Result<(), RegistryError> {
        self.actions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Snapshot of the action bound to `name`, for execution outside the
    /// registry lock.
    pub(crate) fn prepare(
        &self,
        name: &str,
    ) -> Option<(ActionKind, Option<Arc<dyn Any + Send + Sync>>)> {
        self.actions
            .get(name)
            .map(|action| (action.kind.clone(), action.user_data.clone()))
    }
}

/// Executes a shell-command action. `{key}` placeholders in the argv template
/// are rendered from the request parameters.
fn run_command(argv: &[String], params: &Value) -> ActionResult {
    let rendered: Vec<String> = argv.iter().map(|arg| render_arg(arg, params)).collect();
    let Some((program, args)) = rendered.split_first() else {
        return (Status::NotExecutable, "empty command line").into();
    };

    log::debug!("Executing command {rendered:?}");
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => Status::Success.into(),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_owned();
            (Status::ExecutionError, stderr).into()
        }
        Err(error) => (
            Status::NotExecutable,
            format!("unable to run {program:?}: {error}"),
        )
            .into(),
    }
}

fn render_arg(template: &str, params: &Value) -> String {
    let Some(params) = params.as_object() else {
        return template.to_owned();
    };

    let mut rendered = template.to_owned();
    for (key, value) in params {
        let placeholder = format!("{{{key}}}");
        if !rendered.contains(&placeholder) {
            continue;
        }
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &replacement);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn noop() -> ActionKind {
        ActionKind::Command(vec!["true".into()])
    }

    #[test]
    fn registration_is_unique_by_name() {
        let mut registry = ActionRegistry::default();
        registry.add("reboot", noop(), None).unwrap();

        let duplicate = registry.add("reboot", noop(), None);
        assert!(matches!(duplicate, Err(RegistryError::Exists(_))));
        assert!(registry.contains("reboot"));
    }

    #[test]
    fn deregistration_restores_prior_contents() {
        let mut registry = ActionRegistry::default();
        registry.add("reboot", noop(), None).unwrap();

        registry.remove("reboot").unwrap();
        assert!(!registry.contains("reboot"));
        assert!(matches!(
            registry.remove("reboot"),
            Err(RegistryError::NotFound(_))
        ));

        // Same name can be registered again after removal.
        registry.add("reboot", noop(), None).unwrap();
    }

    #[test]
    fn prepare_returns_attached_user_data() {
        let mut registry = ActionRegistry::default();
        let data: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        registry.add("probe", noop(), Some(data)).unwrap();

        let (_, user_data) = registry.prepare("probe").unwrap();
        let value = user_data.unwrap().downcast::<u32>().unwrap();
        assert_eq!(*value, 42);

        assert!(registry.prepare("unknown").is_none());
    }

    #[test]
    fn command_arguments_render_params() {
        assert_eq!(
            render_arg("--file={name}", &json!({"name": "a.bin"})),
            "--file=a.bin"
        );
        assert_eq!(render_arg("--count={n}", &json!({"n": 3})), "--count=3");
        assert_eq!(render_arg("--plain", &json!({"n": 3})), "--plain");
        assert_eq!(render_arg("--x={y}", &json!(null)), "--x={y}");
    }

    #[test]
    fn result_conversions_normalize_all_shapes() {
        let bare: ActionResult = Status::Invoked.into();
        assert_eq!(bare.status, Status::Invoked);
        assert!(bare.message.is_none() && bare.params.is_none());

        let pair: ActionResult = (Status::Failure, "broke").into();
        assert_eq!(pair.message.as_deref(), Some("broke"));

        let triple: ActionResult = (Status::Success, "ok", json!({"r": 1})).into();
        assert_eq!(triple.params, Some(json!({"r": 1})));
    }
}
