use spectral_core::{PlanStep, SafetyFlag};
use std::collections::BTreeSet;

/// Infer tools for a step from keyword heuristics over its description and
/// the original request. Only tools present in `available` are injected.
pub(crate) fn inject_tools_by_heuristics(
    description: &str,
    user_input: &str,
    available: &BTreeSet<String>,
) -> Vec<String> {
    let combined = format!(
        "{} {}",
        description.to_lowercase(),
        user_input.to_lowercase()
    );
    let has = |tool: &str| available.contains(tool);
    let mentions = |words: &[&str]| words.iter().any(|w| combined.contains(w));
    let mut injected = Vec::new();

    // File operations.
    if mentions(&[
        "file", "create", "delete", "list", "move", "copy", "directory", "folder", "write",
        "read",
    ]) {
        if mentions(&["create", "write", "new"]) && has("file_create") {
            injected.push("file_create".to_string());
        } else if mentions(&["list", "show"]) && has("file_list") {
            injected.push("file_list".to_string());
        } else if mentions(&["delete", "remove"]) && has("file_delete") {
            injected.push("file_delete".to_string());
        } else if mentions(&["move", "rename"]) && has("file_move") {
            injected.push("file_move".to_string());
        } else if mentions(&["copy"]) && has("file_copy") {
            injected.push("file_copy".to_string());
        }
    }

    // Applications and processes.
    if mentions(&[
        "open", "launch", "start", "application", "program", "exe", "notepad", "calculator",
    ]) && has("subprocess_open_application")
    {
        injected.push("subprocess_open_application".to_string());
    }

    // System information.
    if mentions(&[
        "system", "info", "information", "status", "processes", "services", "time",
    ]) {
        if mentions(&["processes"]) && has("powershell_get_processes") {
            injected.push("powershell_get_processes".to_string());
        } else if mentions(&["services"]) && has("powershell_get_services") {
            injected.push("powershell_get_services".to_string());
        } else if has("powershell_get_system_info") {
            injected.push("powershell_get_system_info".to_string());
        }
    }

    // Command execution.
    if mentions(&["command", "execute", "run", "script", "powershell", "cmd", "shell"]) {
        if mentions(&["powershell"]) && has("powershell_execute") {
            injected.push("powershell_execute".to_string());
        } else if has("subprocess_execute") {
            injected.push("subprocess_execute".to_string());
        }
    }

    // GUI interaction.
    if mentions(&["click", "mouse", "type", "keyboard", "screenshot", "capture", "gui", "screen"])
    {
        if mentions(&["click"]) && has("gui_click_mouse") {
            injected.push("gui_click_mouse".to_string());
        } else if mentions(&["type", "keyboard"]) && has("typing_type_text") {
            injected.push("typing_type_text".to_string());
        } else if mentions(&["screenshot", "capture"]) && has("gui_capture_screen") {
            injected.push("gui_capture_screen".to_string());
        }
    }

    injected.dedup();

    // Safe informational default when nothing matched.
    if injected.is_empty() {
        for fallback in ["file_list", "powershell_get_system_info"] {
            if has(fallback) {
                injected.push(fallback.to_string());
                break;
            }
        }
        if injected.is_empty() {
            if let Some(first) = available.iter().next() {
                injected.push(first.clone());
            }
        }
    }

    injected
}

/// Rewrite a vague description to lead with the injected tool, unless a
/// tool name already appears in it.
pub(crate) fn make_description_concrete(description: &str, tools: &[String]) -> String {
    if tools.iter().any(|tool| description.contains(tool.as_str())) {
        return description.to_string();
    }
    let Some(primary) = tools.first() else {
        return description.to_string();
    };
    let action_phrase = match primary.as_str() {
        "file_create" => "create a file",
        "file_list" => "list directory contents",
        "file_delete" => "delete the file",
        "file_move" => "move the file",
        "file_copy" => "copy the file",
        "subprocess_open_application" => "launch the application",
        "powershell_execute" => "run the command",
        "subprocess_execute" => "execute the command",
        "powershell_get_system_info" => "get system information",
        "powershell_get_processes" => "get running processes",
        "powershell_get_services" => "get services",
        "gui_click_mouse" => "click at coordinates",
        "typing_type_text" => "type the text",
        "gui_capture_screen" => "capture a screenshot",
        _ => "handle the request",
    };
    if description.trim().is_empty() {
        format!("Use {primary} to {action_phrase}")
    } else {
        format!("Use {primary} to {action_phrase} - {description}")
    }
}

/// Single-step plan synthesized from the user request alone, used when the
/// model reply produced no usable steps.
pub(crate) fn generate_fallback_plan(
    user_input: &str,
    available: &BTreeSet<String>,
) -> Vec<PlanStep> {
    let input = user_input.to_lowercase();
    let has = |tool: &str| available.contains(tool);
    let mentions = |words: &[&str]| words.iter().any(|w| input.contains(w));

    let (tool, description, flags): (&str, String, Vec<SafetyFlag>) = if mentions(&[
        "list", "show", "display", "see",
    ]) && mentions(&["file", "directory", "folder"])
        && has("file_list")
    {
        (
            "file_list",
            "Use file_list to list directory contents".to_string(),
            vec![],
        )
    } else if mentions(&["delete", "remove"]) && mentions(&["file"]) && has("file_delete") {
        // Checked before creation: a deletion request often quotes the
        // original creation in its reference context.
        (
            "file_delete",
            "Use file_delete to delete the requested file".to_string(),
            vec![SafetyFlag::Destructive, SafetyFlag::FileModification],
        )
    } else if mentions(&["create", "new", "write", "make"]) && mentions(&["file"]) && has("file_create")
    {
        (
            "file_create",
            "Use file_create to create a new file".to_string(),
            vec![SafetyFlag::FileModification],
        )
    } else if mentions(&[
        "open", "launch", "start", "application", "program", "app", "notepad", "calculator",
    ]) && has("subprocess_open_application")
    {
        (
            "subprocess_open_application",
            "Use subprocess_open_application to launch the requested application".to_string(),
            vec![SafetyFlag::SystemCommand],
        )
    } else if mentions(&[
        "system", "info", "information", "status", "processes", "services", "time",
    ]) && has("powershell_get_system_info")
    {
        (
            "powershell_get_system_info",
            "Use powershell_get_system_info to retrieve system information".to_string(),
            vec![],
        )
    } else if mentions(&["command", "execute", "run", "script"])
        && (has("powershell_execute") || has("subprocess_execute"))
    {
        let tool = if has("powershell_execute") {
            "powershell_execute"
        } else {
            "subprocess_execute"
        };
        (
            tool,
            format!("Use {tool} to execute the requested command"),
            vec![SafetyFlag::SystemCommand],
        )
    } else if mentions(&["click", "mouse", "gui", "screen"]) && has("gui_click_mouse") {
        (
            "gui_click_mouse",
            "Use gui_click_mouse to perform the requested GUI action".to_string(),
            vec![],
        )
    } else {
        // Prefer safe, informational tools for anything unrecognized.
        let tool = ["file_list", "powershell_get_system_info", "powershell_get_processes"]
            .into_iter()
            .find(|&t| has(t))
            .or_else(|| available.iter().next().map(String::as_str));
        let Some(tool) = tool else {
            return vec![PlanStep::new(1, &format!("Process request: {user_input}"))];
        };
        let flags = if tool.contains("powershell") || tool.contains("subprocess") {
            vec![SafetyFlag::SystemCommand]
        } else {
            vec![]
        };
        (
            tool,
            format!("Use {tool} to handle the request: {user_input}"),
            flags,
        )
    };

    let mut step = PlanStep::new(1, &description);
    step.required_tools = vec![tool.to_string()];
    step.safety_flags = flags;
    vec![step]
}
