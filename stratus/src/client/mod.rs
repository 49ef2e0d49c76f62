use std::{any::Any, panic::RefUnwindSafe, sync::Arc, time::Duration};

use crate::{
    connection::registry::{ActionContext, ActionResult},
    connection::ConnectionHandler,
    publication::Publication,
    status::Status,
};

pub(crate) mod builder;

pub use builder::DeviceClientBuilder;

/// A device client talking to the platform.
///
/// Create one with [`DeviceClientBuilder`], open the session with
/// [`DeviceClient::connect`], and shut it down with
/// [`DeviceClient::disconnect`]. The client is cheap to clone; all clones
/// share one connection.
#[derive(Clone)]
pub struct DeviceClient {
    connection: Arc<ConnectionHandler>,
}

impl DeviceClient {
    pub(crate) fn from_connection(connection: Arc<ConnectionHandler>) -> Self {
        DeviceClient { connection }
    }

    // Lifecycle
    // --------------------------------------------------------------------------------

    /// Connects to the platform, waiting up to `timeout` for the broker to
    /// accept the session. A zero `timeout` waits forever.
    pub fn connect(&self, timeout: Duration) -> Status {
        self.connection.connect(timeout)
    }

    /// Closes the session. With `wait_for_replies`, outstanding requests get
    /// up to `timeout` (zero: unbounded) to receive their replies first.
    pub fn disconnect(&self, wait_for_replies: bool, timeout: Duration) -> Status {
        self.connection.disconnect(wait_for_replies, timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    // Publishing
    // --------------------------------------------------------------------------------

    /// Queues a data point. Accepted in any connection state; queued points
    /// are drained in batches while a session is up.
    pub fn queue_publish(&self, publication: Publication) -> Status {
        self.connection.queue_publish(publication)
    }

    /// Queues a numeric property sample, stamped with the current time.
    pub fn publish_telemetry(&self, name: &str, value: f64) -> Status {
        self.queue_publish(Publication::Telemetry {
            name: name.to_owned(),
            value,
            timestamp: None,
        })
    }

    /// Queues a string attribute, stamped with the current time.
    pub fn publish_attribute(&self, name: &str, value: &str) -> Status {
        self.queue_publish(Publication::Attribute {
            name: name.to_owned(),
            value: value.to_owned(),
            timestamp: None,
        })
    }

    /// Queues an alarm state change.
    pub fn publish_alarm(&self, name: &str, state: i32, message: Option<&str>) -> Status {
        self.queue_publish(Publication::Alarm {
            name: name.to_owned(),
            state,
            message: message.map(str::to_owned),
            timestamp: None,
        })
    }

    /// Queues a position fix. Use [`DeviceClient::queue_publish`] with
    /// [`Publication::Location`] to attach heading, speed, or accuracy.
    pub fn publish_location(&self, latitude: f64, longitude: f64) -> Status {
        self.queue_publish(Publication::Location {
            latitude,
            longitude,
            heading: None,
            altitude: None,
            speed: None,
            accuracy: None,
            fix_type: None,
            timestamp: None,
        })
    }

    /// Queues a line for the cloud-side log.
    pub fn publish_log(&self, message: &str) -> Status {
        self.queue_publish(Publication::Log {
            message: message.to_owned(),
            timestamp: None,
        })
    }

    // Actions
    // --------------------------------------------------------------------------------

    /// Binds a callback to an action name the cloud may invoke. `user_data`
    /// is handed back on every invocation through
    /// [`ActionContext::user_data`].
    ///
    /// Returns [`Status::Exists`] when the name is taken.
    pub fn action_register_callback<F>(
        &self,
        name: &str,
        callback: F,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Status
    where
        F: Fn(&ActionContext) -> ActionResult + Send + Sync + RefUnwindSafe + 'static,
    {
        self.connection
            .action_register_callback(name, Arc::new(callback), user_data)
    }

    /// Binds a command line to an action name. `{key}` placeholders in the
    /// argv template are filled from the request parameters.
    pub fn action_register_command(&self, name: &str, argv: Vec<String>) -> Status {
        self.connection.action_register_command(name, argv)
    }

    /// Removes a previously registered action. Returns [`Status::NotFound`]
    /// when no action of that name exists.
    pub fn action_deregister(&self, name: &str) -> Status {
        self.connection.action_deregister(name)
    }

    // File transfers
    // --------------------------------------------------------------------------------

    /// Asks the cloud for `file_name` and stores it under
    /// `<runtime_dir>/download/` once the checksum verifies. With `blocking`,
    /// waits for the terminal transfer status up to `timeout` (zero:
    /// unbounded).
    pub fn request_download(&self, file_name: &str, blocking: bool, timeout: Duration) -> Status {
        self.connection.request_download(file_name, blocking, timeout)
    }

    /// Offers every file under `<runtime_dir>/upload/` matching the glob
    /// `pattern` to the cloud. With `blocking`, waits until every transfer
    /// finishes or `timeout` (zero: unbounded) expires.
    pub fn request_upload(&self, pattern: &str, blocking: bool, timeout: Duration) -> Status {
        self.connection.request_upload(pattern, blocking, timeout)
    }
}
