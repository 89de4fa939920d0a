use pyo3::prelude::*;

use rtsp::Viewer;

#[pyclass(name = "Viewer", skip_from_py_object)]
#[derive(Clone)]
pub struct PyViewer {
    #[pyo3(get)]
    pub session_id: String,
    #[pyo3(get)]
    pub mount: String,
    #[pyo3(get)]
    pub transports: Vec<String>,
}

impl From<Viewer> for PyViewer {
    fn from(v: Viewer) -> Self {
        PyViewer {
            session_id: v.session_id,
            mount: v.mount,
            transports: v.transports,
        }
    }
}

#[pymethods]
impl PyViewer {
    fn __repr__(&self) -> String {
        format!(
            "Viewer(session_id='{}', mount='{}', transports={:?})",
            self.session_id, self.mount, self.transports
        )
    }
}
