use std::process::Command;

fn main() {
    // git revision reported at startup
    let git_hash = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rerun-if-changed=.git/HEAD");

    // the whisper adapter shells out to ffmpeg for audio extraction
    if std::env::var_os("CARGO_FEATURE_WHISPER").is_some() {
        let ffmpeg_check = Command::new("ffmpeg").arg("-version").output();
        if ffmpeg_check.is_err() {
            println!("cargo:warning=ffmpeg not found in PATH, whisper transcription will fail at runtime");
        }
    }
}
