//! Bootstrap script run by the process and container strategies
//!
//! Invoked as `python3 -I runner.py <program> <result> <policy>`. It guards
//! imports made by the program, runs it as `__main__` and writes the value of
//! a trailing expression statement to `<result>` as `{"value": ...}`.

/// Marker the guard puts into its `ImportError`, used to classify failures
pub(super) const IMPORT_GUARD_MARKER: &str = "is blocked in the sandbox";

pub(super) const RUNNER_SCRIPT: &str = r#"import ast
import builtins
import json
import sys

program_path, result_path, policy_path = sys.argv[1:4]

with open(policy_path) as handle:
    policy = json.load(handle)
forbidden = set(policy.get("forbidden", []))
allowed = set(policy.get("allowed", []))

with open(program_path) as handle:
    source = handle.read()

program_globals = {"__name__": "__main__", "__file__": "<sandbox>", "__builtins__": builtins}
real_import = builtins.__import__


def blocked(name):
    parts = name.split(".")
    for index in range(1, len(parts) + 1):
        if ".".join(parts[:index]) in forbidden:
            return True
    return bool(allowed) and parts[0] not in allowed


def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if globals is program_globals:
        if level > 0:
            raise ImportError("relative import is blocked in the sandbox")
        if blocked(name):
            raise ImportError("import of '%s' is blocked in the sandbox" % name)
    return real_import(name, globals, locals, fromlist, level)


builtins.__import__ = guarded_import

tree = ast.parse(source, "<sandbox>")
trailing = None
if tree.body and isinstance(tree.body[-1], ast.Expr):
    trailing = ast.Expression(tree.body.pop().value)

exec(compile(tree, "<sandbox>", "exec"), program_globals)
value = None
if trailing is not None:
    value = eval(compile(trailing, "<sandbox>", "eval"), program_globals)

sys.stdout.flush()
try:
    encoded = json.dumps({"value": value}, allow_nan=False)
except (TypeError, ValueError):
    encoded = json.dumps({"value": repr(value)})
with open(result_path, "w") as handle:
    handle.write(encoded)
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_message_carries_marker() {
        assert!(RUNNER_SCRIPT.contains(IMPORT_GUARD_MARKER));
        assert!(RUNNER_SCRIPT.contains("globals is program_globals"));
    }
}
