//! Code-mode workspace synthesis.
//!
//! The workspace is a temporary directory of generated ES modules: a bridge
//! module that POSTs tool calls to the loopback bridge, one module (plus a
//! type declaration) per tool, and an index per server. The model's code
//! imports these instead of carrying the tool catalog in context.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;

use super::ident::{sanitize_ascii, sanitize_ident, sanitize_type_name};
use super::SandboxError;
use crate::mcp::ToolLocator;

/// Environment variable carrying the bridge port into the runner.
pub const BRIDGE_PORT_ENV: &str = "CONFAB_BRIDGE_PORT";

const PACKAGE_JSON: &str = "{\n  \"type\": \"module\"\n}\n";

const TSCONFIG_JSON: &str = r#"{
  "compilerOptions": {
    "module": "ESNext",
    "target": "ES2022",
    "moduleResolution": "Node",
    "strict": false
  }
}
"#;

const BRIDGE_MODULE: &str = r#"const port = process.env.CONFAB_BRIDGE_PORT;

export async function callTool(name, args) {
  const response = await fetch(`http://127.0.0.1:${port}/call-tool`, {
    method: "POST",
    headers: { "content-type": "application/json" },
    body: JSON.stringify({ tool: name, args: args ?? {} }),
  });
  const payload = await response.json();
  if (payload.error) {
    throw new Error(payload.error);
  }
  return payload.result;
}

export function extractText(result) {
  const content = result && result.content;
  if (!Array.isArray(content)) {
    return JSON.stringify(result);
  }
  return content
    .filter((item) => item && item.type === "text")
    .map((item) => item.text)
    .join("\n");
}
"#;

/// A synthesized workspace. Dropping it deletes the directory.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Generate the full workspace for the given catalog.
    pub fn synthesize(catalog: &[ToolLocator]) -> Result<Self, SandboxError> {
        let dir = TempDir::with_prefix("confab-sandbox-")?;
        let root = dir.path();

        std::fs::write(root.join("package.json"), PACKAGE_JSON)?;
        std::fs::write(root.join("tsconfig.json"), TSCONFIG_JSON)?;
        std::fs::write(root.join("bridge.mjs"), BRIDGE_MODULE)?;

        let servers_dir = root.join("servers");
        std::fs::create_dir_all(&servers_dir)?;

        let mut current_server: Option<(String, PathBuf, Vec<String>)> = None;
        for locator in catalog {
            let server_ident = sanitize_ident(&locator.server_name);
            let same_server =
                matches!(&current_server, Some((name, _, _)) if *name == server_ident);
            if !same_server {
                if let Some((_, dir, idents)) = current_server.take() {
                    write_index(&dir, &idents)?;
                }
                let dir = servers_dir.join(&server_ident);
                std::fs::create_dir_all(&dir)?;
                current_server = Some((server_ident, dir, Vec::new()));
            }
            if let Some((_, dir, idents)) = &mut current_server {
                let ident = write_tool_module(dir, locator)?;
                idents.push(ident);
            }
        }
        if let Some((_, dir, idents)) = current_server.take() {
            write_index(&dir, &idents)?;
        }

        Ok(Self { dir })
    }
}

fn write_tool_module(server_dir: &Path, locator: &ToolLocator) -> Result<String, SandboxError> {
    let ident = sanitize_ident(&locator.descriptor.name);
    let description = locator
        .descriptor
        .description
        .as_deref()
        .map(sanitize_ascii)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| format!("MCP tool {}", locator.descriptor.name));

    let module = format!(
        "import {{ callTool }} from \"../../bridge.mjs\";\n\n\
         /** {description} */\n\
         export async function {ident}(input) {{\n\
         \x20\x20return callTool({name:?}, input ?? {{}});\n\
         }}\n\n\
         export default {ident};\n",
        name = locator.descriptor.name,
    );
    std::fs::write(server_dir.join(format!("{ident}.mjs")), module)?;

    let declaration = render_declaration(&ident, locator);
    std::fs::write(server_dir.join(format!("{ident}.d.ts")), declaration)?;

    Ok(ident)
}

fn write_index(server_dir: &Path, idents: &[String]) -> Result<(), SandboxError> {
    let mut index = String::new();
    for ident in idents {
        index.push_str(&format!("export {{ default as {ident} }} from \"./{ident}.mjs\";\n"));
    }
    std::fs::write(server_dir.join("index.mjs"), index)?;
    Ok(())
}

/// A `.d.ts` for one tool, derived from its input schema. The mapping is
/// intentionally shallow: enough for editor hints inside the sandbox, not a
/// full JSON Schema compiler.
fn render_declaration(ident: &str, locator: &ToolLocator) -> String {
    let type_name = format!("{}Input", sanitize_type_name(&locator.descriptor.name));
    let mut fields = String::new();

    if let Some(schema) = &locator.descriptor.input_schema {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, property) in properties {
                let ts_type = ts_type_for(property);
                let optional = if required.contains(&name.as_str()) { "" } else { "?" };
                fields.push_str(&format!("  {}{optional}: {ts_type};\n", sanitize_ident(name)));
            }
        }
    }

    format!(
        "export interface {type_name} {{\n{fields}}}\n\n\
         export default function {ident}(input?: {type_name}): Promise<any>;\n"
    )
}

fn ts_type_for(property: &Value) -> &'static str {
    match property.get("type").and_then(Value::as_str) {
        Some("string") => "string",
        Some("number") | Some("integer") => "number",
        Some("boolean") => "boolean",
        Some("array") => "any[]",
        Some("object") => "Record<string, any>",
        _ => "any",
    }
}
