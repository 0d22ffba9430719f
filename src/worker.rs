use crate::config;
use crate::engine::Engine;
use std::sync::Arc;
use std::{io, thread};
use tokio::runtime;
use tokio::sync::Notify;

pub struct Config {
    pub name: String,
    pub stack_size: usize,
    pub max_blocking_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "mtorrent-wire".to_owned(),
            stack_size: 512 * 1024,
            max_blocking_threads: 1,
        }
    }
}

/// Owner of the worker thread. Dropping it shuts the engine down and joins the thread.
pub struct Handle {
    engine: Arc<Engine>,
    rt_handle: runtime::Handle,
    stop_signal: Arc<Notify>,
    th_handle: Option<thread::JoinHandle<()>>,
}

impl Handle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn runtime_handle(&self) -> &runtime::Handle {
        &self.rt_handle
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.stop_signal.notify_one();
        if let Some(th_handle) = self.th_handle.take() {
            let _ = th_handle.join();
        }
    }
}

/// Start an [`Engine`] on a dedicated thread running a single-threaded Tokio runtime
/// with I/O and timers enabled.
pub fn with_runtime(config: Config, engine_config: config::Config) -> io::Result<Handle> {
    let rt = runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .max_blocking_threads(config.max_blocking_threads)
        .build()?;
    let rt_handle = rt.handle().clone();

    let engine = {
        let _guard = rt.enter();
        Arc::new(Engine::start(engine_config, rt_handle.clone())?)
    };

    let stop_signal = Arc::new(Notify::const_new());
    let stop_notified = stop_signal.clone().notified_owned();

    let name = config.name;
    let th_handle = thread::Builder::new().stack_size(config.stack_size).name(name.clone()).spawn({
        let engine = engine.clone();
        move || {
            log::debug!("Worker '{name}' started");
            rt.block_on(async move {
                stop_notified.await;
                engine.shutdown().await;
            });
            log::debug!("Worker '{name}' stopped");
        }
    })?;

    Ok(Handle {
        engine,
        rt_handle,
        stop_signal,
        th_handle: Some(th_handle),
    })
}
