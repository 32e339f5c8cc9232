//! Rux sched_ext 构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml（或 menuconfig 生成的 build/.config）
//! 2. 生成 src/config.rs 中的配置常量

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// 解析 build/.config 文件（`CONFIG_<SECTION>_<KEY>=value` 格式）
///
/// 仅识别 `CONFIG_SMP_` 与 `CONFIG_SCX_` 两个前缀，其余行忽略
fn parse_dot_config(content: &str) -> toml::Value {
    let mut sections: HashMap<&str, toml::map::Map<String, toml::Value>> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        // 跳过注释和空行
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        let (section, config_key) = if let Some(rest) = key.strip_prefix("CONFIG_SMP_") {
            ("smp", rest)
        } else if let Some(rest) = key.strip_prefix("CONFIG_SCX_") {
            ("sched_ext", rest)
        } else {
            continue;
        };

        // 转换值类型
        let parsed_value = if value == "y" || value == "true" {
            toml::Value::Boolean(true)
        } else if value == "n" || value == "false" {
            toml::Value::Boolean(false)
        } else if let Ok(int_val) = value.parse::<i64>() {
            toml::Value::Integer(int_val)
        } else {
            toml::Value::String(value.to_string())
        };

        sections
            .entry(section)
            .or_default()
            .insert(config_key.to_ascii_lowercase(), parsed_value);
    }

    let mut root_map = toml::map::Map::new();
    for (section_name, section_data) in sections {
        root_map.insert(section_name.to_string(), toml::Value::Table(section_data));
    }

    toml::Value::Table(root_map)
}

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=../build/.config");

    // 优先读取 build/.config，回退到 Kernel.toml，两者都没有时使用内置默认值
    let config = if let Ok(content) = fs::read_to_string("../build/.config") {
        println!("cargo:warning=Using build/.config configuration");
        parse_dot_config(&content)
    } else if let Ok(content) = fs::read_to_string("../Kernel.toml") {
        toml::from_str(&content).expect("Kernel.toml 解析失败")
    } else {
        toml::Value::Table(toml::map::Map::new())
    };

    if let Some(name) = config
        .get("general")
        .and_then(|g| g.get("name"))
        .and_then(|v| v.as_str())
    {
        println!("cargo:rustc-env=CARGO_KERNEL_NAME={}", name);
    }

    generate_config_code(&config);
}

fn int_or(config: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

fn generate_config_code(config: &toml::Value) {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    let ordering_vtime = config
        .get("sched_ext")
        .and_then(|s| s.get("default_dsq_ordering"))
        .and_then(|v| v.as_str())
        .map(|s| s.eq_ignore_ascii_case("vtime"))
        .unwrap_or(false);

    let config_header = format!(
        r#"//! Rux sched_ext 配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// SMP 配置
// ============================================================

/// 最大CPU数量
pub const MAX_CPUS: usize = {};

// ============================================================
// sched_ext 配置
// ============================================================

/// 默认时间片 (纳秒)
pub const SCX_SLICE_DFL_NS: u64 = {};

/// watchdog 超时 (毫秒)
pub const SCX_WATCHDOG_TIMEOUT_MS: u64 = {};

/// 单次 ops.dispatch() 最大插入任务数
pub const SCX_DSP_MAX_BATCH: usize = {};

/// 单次 pick_next_task 最多调用 ops.dispatch() 的轮数
pub const SCX_DSP_MAX_LOOPS: usize = {};

/// 认领队首任务的最大重试次数
pub const SCX_CONSUME_MAX_RETRIES: usize = {};

/// 单次 watchdog 检查中触发策略整体失效的升级任务数
pub const SCX_STALL_FAULT_THRESHOLD: usize = {};

/// 自定义 DSQ 是否默认按 vtime 排序
pub const SCX_DSQ_DEFAULT_ORDERING_VTIME: bool = {};
"#,
        int_or(config, "smp", "max_cpus", 64) as usize,
        int_or(config, "sched_ext", "slice_dfl_us", 20000) as u64 * 1000,
        int_or(config, "sched_ext", "watchdog_timeout_ms", 30000) as u64,
        int_or(config, "sched_ext", "dispatch_max_batch", 32) as usize,
        int_or(config, "sched_ext", "dispatch_max_loops", 32) as usize,
        int_or(config, "sched_ext", "consume_max_retries", 8) as usize,
        int_or(config, "sched_ext", "stall_fault_threshold", 8) as usize,
        ordering_vtime,
    );

    let config_file = manifest_dir.join("src").join("config.rs");

    // 只有内容变化时才写入，避免每次编译都更新文件时间戳
    let existing_content = fs::read_to_string(&config_file).unwrap_or_default();
    if existing_content != config_header {
        fs::write(&config_file, &config_header).expect("写入配置文件失败");
    }
}
