// A freshly forked child has not reset signals, redirected or limited
// anything yet, so it has no exec.

use minibox::exec::preexec::{ChildSetup, LaunchPlan};

fn launch(plan: &LaunchPlan) {
    let _ = ChildSetup::new(plan).exec();
}

fn main() {}
