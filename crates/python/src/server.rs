use parking_lot::Mutex;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::types::PyViewer;
use rtsp::{Hooks, Server, ServerConfig};

#[pyclass(name = "Server")]
pub struct PyServer {
    inner: Arc<Mutex<Server>>,
}

impl PyServer {
    fn with_server<F, R>(&self, f: F) -> PyResult<R>
    where
        F: FnOnce(&mut Server) -> R,
    {
        Ok(f(&mut self.inner.lock()))
    }
}

#[pymethods]
impl PyServer {
    #[new]
    #[pyo3(signature = (
        host = "0.0.0.0",
        publisher_port = 5554,
        subscriber_port = 6554,
        rtp_port_start = 10000,
        rtp_port_count = 10000,
        session_timeout = 60,
        users = None,
    ))]
    fn new(
        host: &str,
        publisher_port: u16,
        subscriber_port: u16,
        rtp_port_start: u16,
        rtp_port_count: u16,
        session_timeout: u64,
        users: Option<HashMap<String, String>>,
    ) -> PyResult<Self> {
        let bind_host: IpAddr = host
            .parse()
            .map_err(|e| PyValueError::new_err(format!("invalid host {host:?}: {e}")))?;
        let config = ServerConfig {
            bind_host,
            publisher_port,
            subscriber_port,
            rtp_port_start,
            rtp_port_count,
            session_timeout: Duration::from_secs(session_timeout),
            ..ServerConfig::default()
        };
        config
            .validate()
            .map_err(|e| PyValueError::new_err(e.to_string()))?;

        let hooks = match users {
            Some(users) => Hooks::new().with_credentials(users),
            None => Hooks::new(),
        };
        Ok(PyServer {
            inner: Arc::new(Mutex::new(Server::with_hooks(config, hooks))),
        })
    }

    fn start(&self) -> PyResult<()> {
        self.inner
            .lock()
            .start()
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    fn stop(&self, py: Python<'_>) -> PyResult<()> {
        // Stopping joins the server thread; let other Python threads run.
        let inner = self.inner.clone();
        py.detach(move || inner.lock().stop());
        Ok(())
    }

    fn is_running(&self) -> PyResult<bool> {
        self.with_server(|s| s.is_running())
    }

    /// Publisher `(host, port)`, once started.
    fn publisher_addr(&self) -> PyResult<Option<(String, u16)>> {
        self.with_server(|s| s.publisher_addr().map(|a| (a.ip().to_string(), a.port())))
    }

    /// Subscriber `(host, port)`, once started.
    fn subscriber_addr(&self) -> PyResult<Option<(String, u16)>> {
        self.with_server(|s| s.subscriber_addr().map(|a| (a.ip().to_string(), a.port())))
    }

    /// Paths currently announced by publishers.
    fn mounts(&self) -> PyResult<Vec<String>> {
        self.with_server(|s| s.mounts().paths())
    }

    /// Free RTP/RTCP port pairs left in the pool.
    fn available_port_pairs(&self) -> PyResult<usize> {
        self.with_server(|s| s.port_pool().available())
    }

    fn get_viewers(&self) -> PyResult<Vec<PyViewer>> {
        let viewers = self.inner.lock().viewers();
        Ok(viewers.into_iter().map(PyViewer::from).collect())
    }
}
