//! TSP command vocabulary used by the deployment engine.
//!
//! Every builder takes the node's command prefix (`""` for the controller,
//! `node[N].` for a subordinate node, see [`NodeIdentity::command_prefix`]).
//! Catalog queries print comma-terminated name lists, parsed with
//! [`parse_name_list`].
//!
//! [`NodeIdentity::command_prefix`]: crate::node::NodeIdentity::command_prefix

use crate::codec;

/// Pops the next entry of the error queue as `code, message`.
pub const ERROR_QUEUE_QUERY: &str =
    "do local code, message = errorqueue.next() print(code .. ', ' .. message) end";

/// Opens a script upload on the controller.
pub const LOAD_SCRIPT_KEYWORD: &str = "loadscript";

/// Closes a script upload on the controller.
pub const END_SCRIPT_KEYWORD: &str = "endscript";

/// Reply printed once garbage collection completed.
pub const COLLECT_GARBAGE_DONE: &str = "1";

/// Names in the node's non-volatile user-script catalog.
pub fn embedded_catalog_query(prefix: &str) -> String {
    format!(
        "do local s = '' for name in {prefix}script.user.catalog() do s = s .. name .. ',' end print(s) end"
    )
}

/// Names in the non-volatile catalog whose stored form is byte code.
pub fn byte_code_catalog_query(prefix: &str) -> String {
    format!(
        "do local s = '' for name in {prefix}script.user.catalog() do \
         local src = {prefix}script.user.scripts[name].source \
         if src == nil or string.find(src, '^%s*loadstring') then s = s .. name .. ',' end \
         end print(s) end"
    )
}

/// Names of the scripts in the node's runtime memory.
pub fn loaded_catalog_query(prefix: &str) -> String {
    format!(
        "do local s = '' for name in pairs({prefix}script.user.scripts) do s = s .. name .. ',' end print(s) end"
    )
}

/// Leading characters of a loaded script's source.
pub fn source_head_query(prefix: &str, name: &str) -> String {
    format!(
        "print(string.sub({prefix}{name}.source or '', 1, {}))",
        codec::CLASSIFY_WINDOW
    )
}

/// Calls a version getter and prints its result.
pub fn version_query(prefix: &str, getter: &str) -> String {
    format!("print({prefix}{getter}())")
}

/// Collects garbage, waits for completion and prints [`COLLECT_GARBAGE_DONE`].
pub fn collect_garbage_query(prefix: &str) -> String {
    format!("{prefix}collectgarbage() waitcomplete() print({COLLECT_GARBAGE_DONE})")
}

/// Removes a script from the non-volatile catalog.
pub fn delete_script(prefix: &str, name: &str) -> String {
    format!("{prefix}script.delete('{name}')")
}

/// Drops the runtime reference to a script.
pub fn nil_reference(prefix: &str, name: &str) -> String {
    format!("{prefix}{name} = nil")
}

/// Runs a loaded script.
pub fn run_script(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}.run()")
}

/// Replaces a loaded script's source with its byte code.
pub fn convert_to_byte_code(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}.source = nil")
}

/// Saves a loaded script to non-volatile memory.
pub fn save_script(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}.save()")
}

/// Lines that load a script into a node's runtime memory.
///
/// The controller takes a `loadscript` block. Subordinate nodes receive one
/// `script.new` command whose code is rebuilt with `table.concat`; binary
/// sources are wrapped in a loader payload.
pub fn load_script(prefix: &str, name: &str, source: &str, is_binary: bool) -> Vec<String> {
    if prefix.is_empty() {
        let mut lines = Vec::with_capacity(source.lines().count() + 2);
        lines.push(format!("{LOAD_SCRIPT_KEYWORD} {name}"));
        lines.extend(source.trim_end().lines().map(str::to_string));
        lines.push(END_SCRIPT_KEYWORD.to_string());
        lines
    } else {
        let code = if is_binary {
            codec::loader_payload(source)
        } else {
            codec::text_payload(source)
        };
        vec![format!("{prefix}script.new({code}, '{name}')")]
    }
}

/// Splits a `node[N].` prefix from a command or name.
pub fn split_node_prefix(text: &str) -> (Option<u8>, &str) {
    let Some(rest) = text.strip_prefix("node[") else {
        return (None, text);
    };
    let Some((number, tail)) = rest.split_once("].") else {
        return (None, text);
    };
    match number.parse::<u8>() {
        Ok(node) => (Some(node), tail),
        Err(_) => (None, text),
    }
}

/// Parses the comma-separated reply of a catalog query.
pub fn parse_name_list(reply: &str) -> Vec<String> {
    reply
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "nil")
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_load_block() {
        let lines = load_script("", "isr_support", "a = 1\nb = 2 ", false);
        assert_eq!(lines, vec!["loadscript isr_support", "a = 1", "b = 2", "endscript"]);
    }

    #[test]
    fn test_subordinate_load_command() {
        let lines = load_script("node[2].", "isr_support", "a = 1", false);
        assert_eq!(
            lines,
            vec!["node[2].script.new(table.concat({ [[a = 1]] }, '\\n'), 'isr_support')"]
        );
    }

    #[test]
    fn test_subordinate_binary_load_uses_loader() {
        let lines = load_script("node[2].", "isr_support", "{ 27, 76 }", true);
        assert!(lines[0].starts_with("node[2].script.new(loadstring(table.concat("));
    }

    #[test]
    fn test_split_node_prefix() {
        assert_eq!(split_node_prefix("node[12].isr.run()"), (Some(12), "isr.run()"));
        assert_eq!(split_node_prefix("isr.run()"), (None, "isr.run()"));
        assert_eq!(split_node_prefix("node[x].isr"), (None, "node[x].isr"));
    }

    #[test]
    fn test_parse_name_list() {
        assert_eq!(parse_name_list("isr_support,isr_meter,"), vec!["isr_support", "isr_meter"]);
        assert!(parse_name_list("").is_empty());
        assert!(parse_name_list("nil").is_empty());
    }

    #[test]
    fn test_prefixed_builders() {
        assert_eq!(delete_script("node[2].", "isr"), "node[2].script.delete('isr')");
        assert_eq!(nil_reference("", "isr"), "isr = nil");
        assert_eq!(version_query("", "isr.version"), "print(isr.version())");
        assert_eq!(
            source_head_query("", "isr"),
            "print(string.sub(isr.source or '', 1, 50))"
        );
    }
}
