//! Built-in state implementations.
//!
//! - `approval` - manual gate resumed by an APPROVE or REJECT decision
//! - `shell_script` - run a rendered script with `sh -c`
//! - `fan_out` - spawn one child branch per rendered item
//! - `noop` - succeed immediately

mod approval;
mod fan_out;
mod noop;
mod shell;

pub use self::approval::{approval_response, ApprovalAction, ApprovalState, DEFAULT_APPROVAL_TIMEOUT};
pub use self::fan_out::{spawn_children, FanOutState, DEFAULT_PARAM};
pub use self::noop::NoopState;
pub use self::shell::{run_script, ScriptOutput, ShellScriptConfig, ShellScriptState};
