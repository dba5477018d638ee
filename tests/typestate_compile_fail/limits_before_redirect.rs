// Limits come after the redirections: a low descriptor cap must not stop
// the child from opening its stdin/stdout files.

use minibox::exec::preexec::{ChildSetup, LaunchPlan};

fn launch(plan: &LaunchPlan) {
    let _ = ChildSetup::new(plan).detach().unwrap().apply_limits();
}

fn main() {}
