//! The host application seam.
//!
//! The 3D host application is an external collaborator, consumed opaquely
//! through whatever scripting/scene API it exposes. This module is that
//! seam: [`HostRuntime`] is the minimal surface the command handlers need,
//! and [`NativeHost`] is the one concrete implementation this workspace
//! ships, so the rest of the system is exercisable without a real embedding.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyTuple};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::CoreError;

/// One object in the in-memory scene graph (`NativeHost`'s stand-in for a
/// real 3D scene).
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub name: String,
    pub object_type: String,
    pub location: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: [f64; 3],
    pub visible: bool,
    pub material: Option<String>,
}

/// Scene-wide counters returned alongside the object list by
/// `get_scene_info`.
#[derive(Debug, Clone, Copy)]
pub struct SceneSummary {
    pub materials_count: u32,
    pub frame_current: i64,
    pub frame_start: i64,
    pub frame_end: i64,
}

/// Result of running a script against the host's scripting runtime.
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Wire-requested image format for `get_viewport_screenshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    fn codec(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

impl Default for ImageFormat {
    fn default() -> Self {
        ImageFormat::Png
    }
}

/// A captured (and possibly downscaled) viewport frame written to disk.
pub struct CapturedFrame {
    pub path: std::path::PathBuf,
    pub width: u32,
    pub height: u32,
}

/// The host application surface that the command handlers are written
/// against.
///
/// A real embedding (e.g. a Blender add-on) would implement this against its
/// own scene graph and scripting engine; this workspace ships only
/// [`NativeHost`].
pub trait HostRuntime: Send + Sync {
    /// True when a GUI event loop is available to drive the dispatcher's
    /// `TimerDrivenStepper`; false selects the headless
    /// `ExternallyDrivenStepper` instead.
    fn is_gui_mode(&self) -> bool;

    /// Register a callback to run on the host's own UI timer. Only ever
    /// called when `is_gui_mode()` is true.
    fn register_tick(&self, callback: Box<dyn Fn() + Send + Sync>);

    fn scene_name(&self) -> String;

    /// Scene-wide counters not carried on [`SceneObject`] itself: material
    /// count and the current/start/end frame of the active timeline, for
    /// `get_scene_info`'s result shape.
    fn scene_summary(&self) -> SceneSummary;

    fn list_objects(&self) -> Vec<SceneObject>;

    fn get_object(&self, name: &str) -> Option<SceneObject>;

    /// Execute `source` against the scripting runtime with one shared
    /// mapping as both globals and locals, so a name imported or bound at
    /// module scope is visible inside a function defined later in the same
    /// script — the correctness invariant `execute_code` depends on.
    fn execute_code(&self, source: &str) -> Result<ExecutionOutcome, CoreError>;

    /// Render the current viewport, downscaled so neither dimension exceeds
    /// `max_size`, to `filepath` if given or else a UUID-named file in the
    /// platform temp directory with an extension matching `format`.
    /// `UnsupportedInHeadless` when `is_gui_mode()` is false.
    fn capture_viewport(
        &self,
        max_size: u32,
        format: ImageFormat,
        filepath: Option<&std::path::Path>,
    ) -> Result<CapturedFrame, CoreError>;

    fn request_shutdown(&self);

    /// Whether `request_shutdown` has been called. Polled by the connection
    /// server so `server_shutdown` actually triggers an async `stop()`
    /// instead of only flipping a flag nobody reads.
    fn shutdown_requested(&self) -> bool;

    /// Reset the flag `request_shutdown` set. Called by `Server::start()` so
    /// a stale request from before a `restart()` doesn't immediately drain
    /// the server that was just brought back up.
    fn clear_shutdown_request(&self);
}

struct SceneState {
    objects: HashMap<String, SceneObject>,
    materials_count: u32,
    frame_current: i64,
    frame_start: i64,
    frame_end: i64,
}

/// In-memory, pyo3-backed [`HostRuntime`]. `gui_mode` is fixed at
/// construction — a real embedding would derive it from whether a window
/// system is attached, which this stand-in has no access to.
pub struct NativeHost {
    scene: Arc<Mutex<SceneState>>,
    gui_mode: bool,
    tick_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    shutdown_requested: Arc<std::sync::atomic::AtomicBool>,
}

impl NativeHost {
    pub fn new(gui_mode: bool) -> Self {
        let mut objects = HashMap::new();
        objects.insert(
            "Cube".to_string(),
            SceneObject {
                name: "Cube".to_string(),
                object_type: "MESH".to_string(),
                location: [0.0, 0.0, 0.0],
                rotation: [0.0, 0.0, 0.0],
                scale: [1.0, 1.0, 1.0],
                visible: true,
                material: None,
            },
        );
        NativeHost {
            scene: Arc::new(Mutex::new(SceneState {
                objects,
                materials_count: 0,
                frame_current: 1,
                frame_start: 1,
                frame_end: 250,
            })),
            gui_mode,
            tick_callbacks: Mutex::new(Vec::new()),
            shutdown_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn headless() -> Self {
        Self::new(false)
    }

    /// Drive one registered tick callback (used by `TimerDrivenStepper` tests
    /// in lieu of a real GUI timer).
    pub fn fire_tick(&self) {
        for cb in self.tick_callbacks.lock().iter() {
            cb();
        }
    }

    /// Bind a handful of functions into the script's globals so Python code
    /// run through `execute_code` can inspect and mutate `NativeHost`'s
    /// scene graph — the Rust stand-in for the scene/scripting API a real
    /// embedding would expose to `bpy`-style scripts. Each closure owns a
    /// clone of the scene `Arc`, so it is 'static and outlives the call to
    /// `py.run_bound` safely even though `self` is not.
    fn install_scene_api<'py>(&self, py: Python<'py>, globals: &Bound<'py, PyDict>) -> PyResult<()> {
        let scene = self.scene.clone();
        let add_object = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs| -> PyResult<()> {
                let name: String = args.get_item(0)?.extract()?;
                let object_type: String = args.get_item(1)?.extract()?;
                scene.lock().objects.insert(
                    name.clone(),
                    SceneObject {
                        name,
                        object_type,
                        location: [0.0, 0.0, 0.0],
                        rotation: [0.0, 0.0, 0.0],
                        scale: [1.0, 1.0, 1.0],
                        visible: true,
                        material: None,
                    },
                );
                Ok(())
            },
        )?;
        globals.set_item("mcp_add_object", add_object)?;

        let scene = self.scene.clone();
        let delete_object = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs| -> PyResult<bool> {
                let name: String = args.get_item(0)?.extract()?;
                Ok(scene.lock().objects.remove(&name).is_some())
            },
        )?;
        globals.set_item("mcp_delete_object", delete_object)?;

        let scene = self.scene.clone();
        let rename_object = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs| -> PyResult<bool> {
                let old_name: String = args.get_item(0)?.extract()?;
                let new_name: String = args.get_item(1)?.extract()?;
                let mut state = scene.lock();
                match state.objects.remove(&old_name) {
                    Some(mut object) => {
                        object.name = new_name.clone();
                        state.objects.insert(new_name, object);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            },
        )?;
        globals.set_item("mcp_rename_object", rename_object)?;

        let scene = self.scene.clone();
        let move_object = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs| -> PyResult<bool> {
                let name: String = args.get_item(0)?.extract()?;
                let x: f64 = args.get_item(1)?.extract()?;
                let y: f64 = args.get_item(2)?.extract()?;
                let z: f64 = args.get_item(3)?.extract()?;
                match scene.lock().objects.get_mut(&name) {
                    Some(object) => {
                        object.location = [x, y, z];
                        Ok(true)
                    }
                    None => Ok(false),
                }
            },
        )?;
        globals.set_item("mcp_move_object", move_object)?;

        let scene = self.scene.clone();
        let list_objects = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |_args: &Bound<'_, PyTuple>, _kwargs| -> PyResult<String> {
                let objects: Vec<Value> = scene
                    .lock()
                    .objects
                    .values()
                    .map(object_to_json)
                    .collect();
                Ok(Value::Array(objects).to_string())
            },
        )?;
        globals.set_item("mcp_list_objects", list_objects)?;

        let scene = self.scene.clone();
        let export_object = PyCFunction::new_closure_bound(
            py,
            None,
            None,
            move |args: &Bound<'_, PyTuple>, _kwargs| -> PyResult<Option<String>> {
                let name: String = args.get_item(0)?.extract()?;
                Ok(scene
                    .lock()
                    .objects
                    .get(&name)
                    .map(|object| object_to_json(object).to_string()))
            },
        )?;
        globals.set_item("mcp_export_object", export_object)?;

        Ok(())
    }
}

impl HostRuntime for NativeHost {
    fn is_gui_mode(&self) -> bool {
        self.gui_mode
    }

    fn register_tick(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.tick_callbacks.lock().push(callback);
    }

    fn scene_name(&self) -> String {
        "Scene".to_string()
    }

    fn scene_summary(&self) -> SceneSummary {
        let state = self.scene.lock();
        SceneSummary {
            materials_count: state.materials_count,
            frame_current: state.frame_current,
            frame_start: state.frame_start,
            frame_end: state.frame_end,
        }
    }

    fn list_objects(&self) -> Vec<SceneObject> {
        self.scene.lock().objects.values().cloned().collect()
    }

    fn get_object(&self, name: &str) -> Option<SceneObject> {
        self.scene.lock().objects.get(name).cloned()
    }

    fn execute_code(&self, source: &str) -> Result<ExecutionOutcome, CoreError> {
        let start = Instant::now();
        Python::with_gil(|py| {
            // One PyDict serves as both globals and locals: a name bound by a
            // top-level `import` or assignment must be visible inside a
            // function body defined further down the same script. Passing
            // two separate dicts to `py.run` would give module-level and
            // function-level code different scopes and break that.
            let shared = PyDict::new_bound(py);
            self.install_scene_api(py, &shared)
                .map_err(|e| CoreError::HandlerError {
                    message: e.to_string(),
                    error_type: "HostSetupError".to_string(),
                })?;

            let sys = py.import_bound("sys").map_err(|e| CoreError::HandlerError {
                message: e.to_string(),
                error_type: "PythonRuntimeError".to_string(),
            })?;
            let io = py.import_bound("io").map_err(|e| CoreError::HandlerError {
                message: e.to_string(),
                error_type: "PythonRuntimeError".to_string(),
            })?;
            let stdout_capture = io.call_method0("StringIO").unwrap();
            let stderr_capture = io.call_method0("StringIO").unwrap();
            let prev_stdout = sys.getattr("stdout").unwrap();
            let prev_stderr = sys.getattr("stderr").unwrap();
            sys.setattr("stdout", &stdout_capture).unwrap();
            sys.setattr("stderr", &stderr_capture).unwrap();

            let run_result = py.run_bound(source, Some(&shared), Some(&shared));

            sys.setattr("stdout", prev_stdout).unwrap();
            sys.setattr("stderr", prev_stderr).unwrap();

            let stdout = stdout_capture
                .call_method0("getvalue")
                .and_then(|v| v.extract::<String>())
                .unwrap_or_default();
            let stderr = stderr_capture
                .call_method0("getvalue")
                .and_then(|v| v.extract::<String>())
                .unwrap_or_default();

            let error = run_result.err().map(|e| e.to_string());

            Ok(ExecutionOutcome {
                stdout,
                stderr,
                duration: start.elapsed(),
                error,
            })
        })
    }

    fn capture_viewport(
        &self,
        max_size: u32,
        format: ImageFormat,
        filepath: Option<&std::path::Path>,
    ) -> Result<CapturedFrame, CoreError> {
        if !self.gui_mode {
            return Err(CoreError::UnsupportedInHeadless(
                "get_viewport_screenshot requires a GUI viewport".to_string(),
            ));
        }

        let object_count = self.scene.lock().objects.len() as u32;
        let base = max_size.clamp(16, 4096);
        let (width, height) = (base, base);

        let mut img = image::RgbImage::new(width, height);
        let shade = (40 + (object_count * 20).min(200)) as u8;
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb([shade, shade / 2, 255 - shade]);
        }

        let path = match filepath {
            Some(p) => p.to_path_buf(),
            None => std::env::temp_dir().join(format!("{}.{}", Uuid::new_v4(), format.extension())),
        };
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, format.codec())
            .map_err(|e| CoreError::HandlerError {
                message: e.to_string(),
                error_type: "ViewportCaptureError".to_string(),
            })?;
        std::fs::write(&path, buf.into_inner()).map_err(CoreError::Io)?;

        Ok(CapturedFrame { path, width, height })
    }

    fn request_shutdown(&self) {
        self.shutdown_requested
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn clear_shutdown_request(&self) {
        self.shutdown_requested
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

/// A JSON-shaped summary of a [`SceneObject`], as returned by `get_scene_info`
/// / `get_object_info`.
pub fn object_to_json(obj: &SceneObject) -> Value {
    json!({
        "name": obj.name,
        "type": obj.object_type,
        "location": obj.location,
        "rotation": obj.rotation,
        "scale": obj.scale,
        "visible": obj.visible,
        "material": obj.material,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_host_reports_no_gui() {
        let host = NativeHost::headless();
        assert!(!host.is_gui_mode());
    }

    #[test]
    fn headless_viewport_capture_is_unsupported() {
        let host = NativeHost::headless();
        let err = host.capture_viewport(256, ImageFormat::Png, None).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedInHeadless(_)));
    }

    #[test]
    fn gui_viewport_capture_writes_a_file() {
        let host = NativeHost::new(true);
        let frame = host.capture_viewport(128, ImageFormat::Png, None).unwrap();
        assert!(frame.path.exists());
        assert_eq!(frame.width, 128);
        std::fs::remove_file(frame.path).unwrap();
    }

    #[test]
    fn execute_code_shares_globals_and_locals() {
        let host = NativeHost::headless();
        let outcome = host
            .execute_code("import math\ndef f():\n    return math.sqrt(16)\nprint(f())\n")
            .unwrap();
        assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);
        assert_eq!(outcome.stdout.trim(), "4.0");
    }

    #[test]
    fn execute_code_reports_python_errors_without_panicking() {
        let host = NativeHost::headless();
        let outcome = host.execute_code("raise ValueError('boom')").unwrap();
        assert!(outcome.error.is_some());
    }

    #[test]
    fn scripted_scene_mutations_are_visible_through_get_object_info() {
        let host = NativeHost::headless();
        let outcome = host
            .execute_code("mcp_add_object('Sphere', 'MESH')\nmcp_move_object('Sphere', 1.0, 2.0, 3.0)\n")
            .unwrap();
        assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);

        let sphere = host.get_object("Sphere").expect("Sphere should exist after the script ran");
        assert_eq!(sphere.location, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn scripted_list_objects_reflects_rust_side_state() {
        let host = NativeHost::headless();
        let outcome = host.execute_code("print('OBJECTS_JSON:' + mcp_list_objects())").unwrap();
        assert!(outcome.error.is_none(), "unexpected error: {:?}", outcome.error);
        assert!(outcome.stdout.contains("OBJECTS_JSON:"));
        assert!(outcome.stdout.contains("\"Cube\""));
    }

    #[test]
    fn default_scene_has_a_cube() {
        let host = NativeHost::headless();
        assert!(host.get_object("Cube").is_some());
        assert_eq!(host.list_objects().len(), 1);
    }
}
