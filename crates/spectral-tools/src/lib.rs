mod files;
mod gui;
mod misc;
mod params;
mod policy;
mod registry;
mod shell;
mod system;

pub use gui::PointerState;
pub use policy::PathPolicy;
pub use registry::RegistryHive;
pub use shell::{PlatformShellRunner, ShellRunner};

use files::FileActions;
use gui::GuiActions;
use misc::{OcrActions, TypingActions};
use registry::RegistryActions;
use serde_json::Value;
use spectral_core::ActionResult;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use system::{PowershellActions, SubprocessActions};

/// One entry per adapter: (family, action name, one-line description,
/// whether the action mutates state and therefore honors dry-run).
const CATALOG: &[(&str, &str, &str, bool)] = &[
    ("file", "file_list", "List directory contents", false),
    ("file", "file_read", "Read a text file", false),
    ("file", "file_create", "Create a file with optional content", true),
    ("file", "file_create_directory", "Create a directory", true),
    ("file", "file_delete", "Delete a file", true),
    ("file", "file_delete_directory", "Delete a directory recursively", true),
    ("file", "file_move", "Move or rename a file", true),
    ("file", "file_copy", "Copy a file", true),
    ("gui", "gui_move_mouse", "Move the pointer to coordinates", true),
    ("gui", "gui_click_mouse", "Click at coordinates", true),
    ("gui", "gui_capture_screen", "Capture a screenshot", false),
    ("typing", "typing_type_text", "Type text via the keyboard", true),
    ("registry", "registry_read_value", "Read a registry value", false),
    ("registry", "registry_write_value", "Write a registry value", true),
    ("registry", "registry_delete_value", "Delete a registry value", true),
    ("ocr", "ocr_extract_text", "Extract text from an image", false),
    ("powershell", "powershell_execute", "Run a PowerShell command", true),
    ("powershell", "powershell_get_system_info", "Get system information", false),
    ("powershell", "powershell_get_processes", "Get running processes", false),
    ("powershell", "powershell_get_services", "Get services", false),
    ("subprocess", "subprocess_execute", "Run a system command", true),
    ("subprocess", "subprocess_open_application", "Launch an application", true),
];

/// What the pipeline consumes from the registry: the catalog and the
/// routing entry point. `ActionRouter` is the production implementation;
/// tests substitute scripted hosts.
pub trait ActionHost: Send + Sync {
    fn list_available_actions(&self) -> BTreeMap<String, BTreeMap<String, String>>;
    fn route(&self, action_type: &str, params: &Value) -> ActionResult;

    fn knows(&self, action_type: &str) -> bool {
        self.list_available_actions()
            .values()
            .any(|family| family.contains_key(action_type))
    }

    fn tool_names(&self) -> Vec<String> {
        self.list_available_actions()
            .values()
            .flat_map(|family| family.keys().cloned())
            .collect()
    }
}

/// Process-wide catalog of action adapters. `route` is the single entry
/// point: it dispatches on the action name, enforces dry-run for mutating
/// actions, and stamps `execution_time_ms` on every result.
pub struct ActionRouter {
    files: FileActions,
    gui: GuiActions,
    typing: TypingActions,
    registry: RegistryActions,
    ocr: OcrActions,
    powershell: PowershellActions,
    subprocess: SubprocessActions,
    pointer: PointerState,
    hive: RegistryHive,
    dry_run: AtomicBool,
}

impl ActionRouter {
    pub fn new(policy: PathPolicy, runner: Arc<dyn ShellRunner>) -> Self {
        let pointer = PointerState::default();
        let hive = RegistryHive::default();
        Self {
            files: FileActions::new(policy),
            gui: GuiActions::new(pointer.clone()),
            typing: TypingActions,
            registry: RegistryActions::new(hive.clone()),
            ocr: OcrActions,
            powershell: PowershellActions::new(runner.clone()),
            subprocess: SubprocessActions::new(runner),
            pointer,
            hive,
            dry_run: AtomicBool::new(false),
        }
    }

    pub fn with_defaults(policy: PathPolicy) -> Self {
        Self::new(policy, Arc::new(PlatformShellRunner))
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::SeqCst);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::SeqCst)
    }

    /// Pointer state handle for the step verifier.
    pub fn pointer(&self) -> PointerState {
        self.pointer.clone()
    }

    /// Registry hive handle for the step verifier.
    pub fn registry_hive(&self) -> RegistryHive {
        self.hive.clone()
    }

    /// `family -> { action name -> description }`, ordered.
    pub fn list_available_actions(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut out: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (family, name, description, _) in CATALOG {
            out.entry(family.to_string())
                .or_default()
                .insert(name.to_string(), description.to_string());
        }
        out
    }

    /// Flat set of every routable action name.
    pub fn tool_names(&self) -> Vec<String> {
        CATALOG.iter().map(|(_, name, _, _)| name.to_string()).collect()
    }

    pub fn knows(&self, action_type: &str) -> bool {
        CATALOG.iter().any(|(_, name, _, _)| *name == action_type)
    }

    pub fn route(&self, action_type: &str, params: &Value) -> ActionResult {
        let started = Instant::now();
        let result = self.dispatch(action_type, params);
        let elapsed = started.elapsed().as_millis() as u64;
        result.with_elapsed_ms(elapsed)
    }

    fn dispatch(&self, action_type: &str, params: &Value) -> ActionResult {
        let Some((_, _, description, mutating)) = CATALOG
            .iter()
            .find(|(_, name, _, _)| *name == action_type)
        else {
            return ActionResult::fail(
                action_type,
                format!("unknown action type: {action_type}"),
            );
        };

        if *mutating && self.is_dry_run() {
            return ActionResult::ok(
                action_type,
                format!("[DRY RUN] Would {}", lowercase_first(description)),
            );
        }

        match action_type {
            "file_list" => self.files.list(params),
            "file_read" => self.files.read_file(params),
            "file_create" => self.files.create_file(params),
            "file_create_directory" => self.files.create_directory(params),
            "file_delete" => self.files.delete_file(params),
            "file_delete_directory" => self.files.delete_directory(params),
            "file_move" => self.files.move_file(params),
            "file_copy" => self.files.copy_file(params),
            "gui_move_mouse" => self.gui.move_mouse(params),
            "gui_click_mouse" => self.gui.click_mouse(params),
            "gui_capture_screen" => self.gui.capture_screen(params),
            "typing_type_text" => self.typing.type_text(params),
            "registry_read_value" => self.registry.read_value(params),
            "registry_write_value" => self.registry.write_value(params),
            "registry_delete_value" => self.registry.delete_value(params),
            "ocr_extract_text" => self.ocr.extract_text(params),
            "powershell_execute" => self.powershell.execute(params),
            "powershell_get_system_info" => self.powershell.get_system_info(params),
            "powershell_get_processes" => self.powershell.get_processes(params),
            "powershell_get_services" => self.powershell.get_services(params),
            "subprocess_execute" => self.subprocess.execute(params),
            "subprocess_open_application" => self.subprocess.open_application(params),
            other => ActionResult::fail(other, format!("unknown action type: {other}")),
        }
    }
}

impl ActionHost for ActionRouter {
    fn list_available_actions(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        ActionRouter::list_available_actions(self)
    }

    fn route(&self, action_type: &str, params: &Value) -> ActionResult {
        ActionRouter::route(self, action_type, params)
    }

    fn knows(&self, action_type: &str) -> bool {
        ActionRouter::knows(self, action_type)
    }

    fn tool_names(&self) -> Vec<String> {
        ActionRouter::tool_names(self)
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
