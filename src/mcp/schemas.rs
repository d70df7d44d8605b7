use serde_json::{json, Map, Value};

// Helper to create a JSON schema property
fn create_prop(type_str: &str, description: &str) -> Value {
    json!({
        "type": type_str,
        "description": description
    })
}

fn create_prop_with_default_bool(description: &str, default_val: bool) -> Value {
    json!({
        "type": "boolean",
        "description": description,
        "default": default_val
    })
}

fn create_enum_prop(enum_values: &[&str], default_value: &str, description: &str) -> Value {
    json!({
        "type": "string",
        "enum": enum_values,
        "default": default_value,
        "description": description
    })
}

fn object_schema(required: &[&str], properties: Vec<(&str, Value)>) -> Value {
    let properties: Map<String, Value> = properties
        .into_iter()
        .map(|(name, prop)| (name.to_string(), prop))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

const PATH_GUIDANCE: &str = "Device path, '/'-separated. Relative paths are taken from the device root.";

fn timeout_prop(default_desc: &str) -> Value {
    create_prop(
        "integer",
        &format!("Milliseconds to wait for the program to finish. Defaults to {}.", default_desc),
    )
}

pub fn empty_schema() -> Value {
    object_schema(&[], vec![])
}

pub fn device_connect_schema() -> Value {
    object_schema(
        &[],
        vec![
            ("port", create_prop("string", "Serial port to open, e.g. /dev/ttyUSB0 or COM3. Defaults to SERIAL_PORT or the first USB serial port found.")),
            ("baud_rate", create_prop("integer", "Bit rate. Defaults to BAUD_RATE (115200).")),
        ],
    )
}

pub fn run_code_schema() -> Value {
    object_schema(
        &["code"],
        vec![
            ("code", create_prop("string", "MicroPython source to run in raw mode. Its printed output is returned.")),
            ("timeout_ms", timeout_prop("RUN_TIMEOUT_MS")),
        ],
    )
}

pub fn save_and_run_schema() -> Value {
    object_schema(
        &["code"],
        vec![
            ("code", create_prop("string", "MicroPython source to store on the device and then run.")),
            ("filename", create_prop("string", "Target file on the device. Defaults to main.py.")),
            ("timeout_ms", timeout_prop("RUN_TIMEOUT_MS")),
        ],
    )
}

pub fn repl_send_schema() -> Value {
    object_schema(
        &["line"],
        vec![("line", create_prop("string", "One line of input for the interactive >>> prompt."))],
    )
}

pub fn terminal_command_schema() -> Value {
    object_schema(
        &["input"],
        vec![(
            "input",
            create_prop(
                "string",
                "Terminal input. help, clear, status, connect, disconnect, :raw and :friendly are handled locally; anything else is sent to the device prompt.",
            ),
        )],
    )
}

pub fn read_terminal_schema() -> Value {
    object_schema(
        &[],
        vec![
            ("lines", create_prop("integer", "Number of trailing transcript lines to return. Default 200.")),
            ("scroll_to", create_prop("integer", "Moves the viewport to this line index before reading.")),
            ("viewport_height", create_prop("integer", "Rows in the viewport.")),
        ],
    )
}

pub fn list_directory_schema() -> Value {
    object_schema(
        &[],
        vec![("path", create_prop("string", &format!("Directory to list. Defaults to '/'. {}", PATH_GUIDANCE)))],
    )
}

pub fn read_file_schema() -> Value {
    object_schema(
        &["path"],
        vec![
            ("path", create_prop("string", &format!("File to read. {}", PATH_GUIDANCE))),
            (
                "encoding",
                create_enum_prop(&["text", "base64"], "text", "How to return the content. Non UTF-8 files always come back as base64."),
            ),
        ],
    )
}

pub fn write_file_schema() -> Value {
    object_schema(
        &["path", "content"],
        vec![
            ("path", create_prop("string", &format!("File to write, replacing any existing file. {}", PATH_GUIDANCE))),
            ("content", create_prop("string", "File content. Limited to MAX_WRITE_BYTES (60000 by default) after decoding.")),
            ("encoding", create_enum_prop(&["text", "base64"], "text", "Encoding of 'content'.")),
        ],
    )
}

pub fn delete_path_schema() -> Value {
    object_schema(
        &["path"],
        vec![
            ("path", create_prop("string", &format!("File or empty directory to remove. {}", PATH_GUIDANCE))),
            ("is_dir", create_prop_with_default_bool("Set to true to remove a directory.", false)),
        ],
    )
}

pub fn create_directory_schema() -> Value {
    object_schema(
        &["path"],
        vec![("path", create_prop("string", &format!("Directory to create. {}", PATH_GUIDANCE)))],
    )
}

pub fn rename_path_schema() -> Value {
    object_schema(
        &["source", "destination"],
        vec![
            ("source", create_prop("string", &format!("Existing path. {}", PATH_GUIDANCE))),
            ("destination", create_prop("string", "New path.")),
        ],
    )
}
