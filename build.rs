// build.rs

fn main() {
    // Generate build info. Missing git metadata (e.g. building from a
    // source tarball) must not fail the build.
    if let Err(e) = vergen::EmitBuilder::builder()
        .all_build()
        .all_git()
        .emit()
    {
        println!("cargo:warning=Unable to generate build info: {}", e);
    }
}
