//! Scripted in-memory runtime for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::sandbox::runtime::{ContainerRuntime, InstanceSpec, OutputChunk, OutputStream};

/// A recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    EnsureImage(String),
    Create(String),
    Upload(String),
    Attach(String),
    Start(String),
    Wait(String),
    Inspect(String),
    Kill(String),
    Remove(String),
}

/// What the fake runtime does on each call.
#[derive(Default)]
pub(crate) struct Script {
    pub pull_error: Option<RuntimeError>,
    pub create_error: Option<RuntimeError>,
    pub upload_error: Option<RuntimeError>,
    pub attach_error: Option<RuntimeError>,
    pub start_error: Option<RuntimeError>,
    pub wait_error: Option<RuntimeError>,
    pub inspect_error: Option<RuntimeError>,
    pub kill_error: Option<RuntimeError>,
    pub remove_error: Option<RuntimeError>,
    /// Chunks yielded by the attached output stream.
    pub output: Vec<OutputChunk>,
    /// Error yielded after `output` is exhausted.
    pub output_error: Option<RuntimeError>,
    pub exit_code: i64,
    /// How long `wait_terminal` blocks before the program "exits".
    pub run_for: Option<Duration>,
    pub hang_pull: bool,
    pub hang_create: bool,
    pub hang_teardown: bool,
    /// How long `kill` takes before returning.
    pub teardown_delay: Option<Duration>,
}

pub(crate) struct FakeRuntime {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
    specs: Mutex<Vec<InstanceSpec>>,
    uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    next_id: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn specs(&self) -> Vec<InstanceSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// Container name of the first created instance.
    pub fn first_name(&self) -> String {
        self.specs.lock().unwrap()[0].name.clone()
    }

    /// `(instance_id, dest_dir, archive)` for each upload.
    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn scripted_error(
        &self,
        pick: impl FnOnce(&Script) -> Option<RuntimeError>,
    ) -> Result<(), RuntimeError> {
        match pick(&self.script.lock().unwrap()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(Call::EnsureImage(image.to_string()));
        let hang = self.script.lock().unwrap().hang_pull;
        if hang {
            std::future::pending::<()>().await;
        }
        self.scripted_error(|s| s.pull_error.clone())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        self.record(Call::Create(spec.image.clone()));
        self.specs.lock().unwrap().push(spec.clone());
        let hang = self.script.lock().unwrap().hang_create;
        if hang {
            std::future::pending::<()>().await;
        }
        self.scripted_error(|s| s.create_error.clone())?;
        Ok(format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn upload_archive(
        &self,
        instance_id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        self.record(Call::Upload(instance_id.to_string()));
        self.scripted_error(|s| s.upload_error.clone())?;
        self.uploads
            .lock()
            .unwrap()
            .push((instance_id.to_string(), dest_dir.to_string(), archive));
        Ok(())
    }

    async fn attach_output(&self, instance_id: &str) -> Result<OutputStream, RuntimeError> {
        self.record(Call::Attach(instance_id.to_string()));
        self.scripted_error(|s| s.attach_error.clone())?;
        let script = self.script.lock().unwrap();
        let mut items: Vec<Result<OutputChunk, RuntimeError>> =
            script.output.iter().cloned().map(Ok).collect();
        if let Some(e) = &script.output_error {
            items.push(Err(e.clone()));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn start(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Start(instance_id.to_string()));
        self.scripted_error(|s| s.start_error.clone())
    }

    async fn wait_terminal(&self, instance_id: &str) -> Result<i64, RuntimeError> {
        self.record(Call::Wait(instance_id.to_string()));
        let run_for = self.script.lock().unwrap().run_for;
        if let Some(d) = run_for {
            tokio::time::sleep(d).await;
        }
        self.scripted_error(|s| s.wait_error.clone())?;
        Ok(self.script.lock().unwrap().exit_code)
    }

    async fn inspect_exit_code(&self, instance_id: &str) -> Result<i64, RuntimeError> {
        self.record(Call::Inspect(instance_id.to_string()));
        self.scripted_error(|s| s.inspect_error.clone())?;
        Ok(self.script.lock().unwrap().exit_code)
    }

    async fn kill(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Kill(instance_id.to_string()));
        let (hang, delay) = {
            let script = self.script.lock().unwrap();
            (script.hang_teardown, script.teardown_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.scripted_error(|s| s.kill_error.clone())
    }

    async fn remove(&self, instance_id: &str) -> Result<(), RuntimeError> {
        self.record(Call::Remove(instance_id.to_string()));
        let hang = self.script.lock().unwrap().hang_teardown;
        if hang {
            std::future::pending::<()>().await;
        }
        self.scripted_error(|s| s.remove_error.clone())
    }
}
