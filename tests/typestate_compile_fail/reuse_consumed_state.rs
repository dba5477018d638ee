// Each step consumes the previous state.

use minibox::exec::preexec::{ChildSetup, LaunchPlan};

fn launch(plan: &LaunchPlan) {
    let fresh = ChildSetup::new(plan);
    let _detached = fresh.detach();
    let _again = fresh.detach();
}

fn main() {}
