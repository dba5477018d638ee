// Exec straight after the redirections would run the program without
// resource limits.

use minibox::exec::preexec::{ChildSetup, LaunchPlan};

fn launch(plan: &LaunchPlan) {
    let redirected = ChildSetup::new(plan)
        .detach()
        .unwrap()
        .redirect_stdio()
        .unwrap();
    let _ = redirected.exec();
}

fn main() {}
