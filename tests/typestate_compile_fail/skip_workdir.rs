// The working directory step cannot be skipped, even when no directory is
// configured.

use minibox::exec::preexec::{ChildSetup, LaunchPlan};

fn launch(plan: &LaunchPlan) {
    let limited = ChildSetup::new(plan)
        .detach()
        .unwrap()
        .redirect_stdio()
        .unwrap()
        .apply_limits()
        .unwrap();
    let _ = limited.exec();
}

fn main() {}
