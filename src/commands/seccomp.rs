//! `seccomp`: print the syscall policy applied to containers.

use anyhow::Result;

use execbox::SeccompPolicy;

pub fn run() -> Result<()> {
    println!("{}", SeccompPolicy::build().to_json()?);
    Ok(())
}
