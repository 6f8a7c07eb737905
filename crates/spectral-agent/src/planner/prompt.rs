use std::collections::BTreeMap;

/// Render the live tool catalog for the planning prompt. The model may only
/// reference tools from this list.
pub(crate) fn format_tool_catalog(
    actions: &BTreeMap<String, BTreeMap<String, String>>,
) -> String {
    let mut catalog = String::from(
        "AVAILABLE TOOLS:\n================\n\n\
         You must use ONLY the following tools. Each step must specify at \
         least one tool from this list:\n",
    );
    for (family, tools) in actions {
        catalog.push_str(&format!("\n{} TOOLS:\n", family.to_uppercase()));
        for (name, description) in tools {
            catalog.push_str(&format!("  - {name}: {description}\n"));
        }
    }
    catalog.push_str(
        "\nTOOL USAGE EXAMPLES:\n====================\n\
         - For file operations: \"Use file_create to create a new file\", \"Use file_list to list directory contents\"\n\
         - For applications: \"Use subprocess_open_application to launch an application\"\n\
         - For system info: \"Use powershell_get_system_info to get system information\"\n\
         - For GUI: \"Use gui_click_mouse to click at coordinates\", \"Use typing_type_text to type text\"\n\
         - For commands: \"Use powershell_execute to run a PowerShell command\", \"Use subprocess_execute to run a system command\"\n\
         \nIMPORTANT: Every step MUST include at least one required_tools entry from the list above.\n",
    );
    catalog
}

/// The planning instruction block. RAG enrichment, when available, is
/// prepended by the caller.
pub(crate) fn build_planning_prompt(user_input: &str, tool_catalog: &str) -> String {
    format!(
        "Generate a detailed execution plan for the following request.\n\
         Break it down into clear, sequential steps.\n\n\
         Request: {user_input}\n\n\
         {tool_catalog}\n\
         Respond with valid JSON containing:\n\
         - description: High-level summary of the plan\n\
         - steps: Array of steps, each with:\n\
           - step_number: Sequential number starting from 1\n\
           - description: What to do in this step (be specific and actionable)\n\
           - required_tools: Array of tool names needed (from the catalog above)\n\
           - dependencies: Array of step numbers this step depends on\n\
           - safety_flags: Array of safety concerns (use: destructive, network_access, \
             file_modification, system_command, external_dependency)\n\
           - estimated_duration: Estimated time (e.g., \"5 minutes\")\n\n\
         Ensure:\n\
         1. Steps are in logical order\n\
         2. Dependencies reference earlier steps only\n\
         3. No circular dependencies\n\
         4. Each step is focused on a single task\n\
         5. Safety flags are appropriately set\n\
         6. Every step has at least one required tool from the catalog\n\
         7. Descriptions are specific and reference concrete actions\n\n\
         Return only valid JSON, no other text.\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lists_families_and_tools() {
        let mut actions = BTreeMap::new();
        let mut file = BTreeMap::new();
        file.insert("file_create".to_string(), "Create a file".to_string());
        actions.insert("file".to_string(), file);

        let rendered = format_tool_catalog(&actions);
        assert!(rendered.contains("FILE TOOLS:"));
        assert!(rendered.contains("file_create: Create a file"));
    }

    #[test]
    fn prompt_embeds_request_and_catalog() {
        let prompt = build_planning_prompt("list my files", "CATALOG HERE");
        assert!(prompt.contains("Request: list my files"));
        assert!(prompt.contains("CATALOG HERE"));
        assert!(prompt.contains("Return only valid JSON"));
    }
}
