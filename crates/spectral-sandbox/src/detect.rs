//! GUI detection for generated programs.

const GUI_FRAMEWORKS: &[&str] = &[
    "tkinter",
    "customtkinter",
    "ctk",
    "pyqt5",
    "pyqt6",
    "pyside2",
    "pyside6",
    "pygame",
    "kivy",
    "wx",
];

const MAINLOOP_CALLS: &[&str] = &["mainloop()", "app.run()"];

/// Whether the code pulls in a known GUI framework.
pub fn is_gui_program(code: &str) -> bool {
    let code_lc = code.to_lowercase();
    GUI_FRAMEWORKS.iter().any(|fw| code_lc.contains(fw))
}

/// Find a blocking GUI mainloop call that would run at import or top
/// level. Calls inside a gated `if __name__ == "__main__":` block do not
/// count — those only fire when the program is executed directly, which
/// the smoke gate controls.
pub fn detect_gui_mainloop(code: &str) -> Option<String> {
    let mut gated_indent: Option<usize> = None;
    for line in code.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - line.trim_start().len();

        if let Some(gate) = gated_indent {
            if indent > gate {
                // Still inside the gated main block.
                continue;
            }
            gated_indent = None;
        }

        if trimmed.starts_with("if __name__") && trimmed.contains("__main__") {
            gated_indent = Some(indent);
            continue;
        }

        for call in MAINLOOP_CALLS {
            if trimmed.contains(call) {
                return Some(call.trim_end_matches("()").to_string() + "()");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_gui_frameworks_case_insensitively() {
        assert!(is_gui_program("import tkinter"));
        assert!(is_gui_program("from PyQt6 import QtWidgets"));
        assert!(is_gui_program("import pygame"));
        assert!(!is_gui_program("import argparse\nprint('cli')"));
    }

    #[test]
    fn top_level_mainloop_is_flagged() {
        let code = "import tkinter as tk\nroot = tk.Tk()\nroot.mainloop()\n";
        assert_eq!(detect_gui_mainloop(code).as_deref(), Some("mainloop()"));
    }

    #[test]
    fn app_run_is_flagged() {
        let code = "app = App()\napp.run()\n";
        assert_eq!(detect_gui_mainloop(code).as_deref(), Some("app.run()"));
    }

    #[test]
    fn gated_mainloop_is_allowed() {
        let code = "import tkinter as tk\n\n\
                    def build():\n    return tk.Tk()\n\n\
                    if __name__ == \"__main__\":\n    root = build()\n    root.mainloop()\n";
        assert!(detect_gui_mainloop(code).is_none());
    }

    #[test]
    fn mainloop_after_gated_block_is_flagged() {
        let code = "if __name__ == \"__main__\":\n    pass\nroot.mainloop()\n";
        assert_eq!(detect_gui_mainloop(code).as_deref(), Some("mainloop()"));
    }
}
