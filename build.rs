use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // 编译时间戳：Agent 与插件侧 Client 在 Connect 握手中互相报告
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", timestamp);
    println!("cargo:rerun-if-changed=build.rs");
}
