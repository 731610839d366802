use insta::assert_snapshot;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use clap::error::ErrorKind;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl te::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(
    args: te::Args,
    output_format: te::OutputFormat,
) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let options = args.run_options();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let hardware_client = match maybe_fake_args {
        Some(fake_args) => te::fake_hardware_client(fake_args),
        None => te::real_hardware_client(),
    };
    te::run_with_clients(
        command,
        &options,
        &mut output,
        &FakeTerminalClient,
        hardware_client,
        output_format,
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(argv: [&str; N]) -> anyhow::Result<String> {
    let parsed_args = te::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args, te::OutputFormat::Pretty).await
}

#[tokio::test(start_paused = true)]
async fn ls_command_prints_device_table() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "can0:0xf3,fw=2.2.0;usb:1-1;can0:0xf2,silent",
        "ls",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @r"
    ╭───┬───────────┬───────────┬──────────┬────────────┬─────────╮
    │ # │ address   │ hardware  │ firmware │ bootloader │ project │
    ├───┼───────────┼───────────┼──────────┼────────────┼─────────┤
    │ 0 │ usb:1-1   │ TE_RF_USB │ 2.1.7    │ 1.0.3      │ 1.4.0   │
    │ 1 │ can0:0xf3 │ TE_RF_CAN │ 2.2.0    │ 1.0.3      │ 1.4.0   │
    ╰───┴───────────┴───────────┴──────────┴────────────┴─────────╯
    ");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ls_command_writes_json_rows() -> anyhow::Result<()> {
    let fake = te::FakeArgs::builder().fixture("usb:1-1;can0:0xf2")?.build();
    let args = te::Args::new(te::Command::Ls).with_fake(fake);

    let stdout = run_with_parsed_args(args, te::OutputFormat::Json).await?;
    let rows: serde_json::Value = serde_json::from_str(&stdout)?;

    let rows = rows.as_array().expect("ls should print a JSON array");
    assert_eq!(2, rows.len());
    assert_eq!("usb:1-1", rows[0]["address"]);
    assert_eq!("can0:0xf2", rows[1]["address"]);
    assert_eq!(1, rows[1]["index"]);
    assert_eq!("TE_RF_CAN", rows[1]["hardware_id"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn ls_command_without_any_transport_fails() {
    let result = run_with_argv([
        "te",
        "--no-hid",
        "--fake",
        "--fake-devices",
        "usb:1-1",
        "ls",
    ])
    .await;

    let error = result.expect_err("no transport should be available");
    assert_eq!("no transport could be opened (0 attempted)", error.to_string());
}

#[tokio::test(start_paused = true)]
async fn info_command_prints_identity() -> anyhow::Result<()> {
    let args = te::Args::new(te::Command::Info(te::InfoArgs::new(0)))
        .with_fake(te::FakeArgs::builder().fixture("can0:0xf2,no-project")?.build());

    let stdout = run_with_parsed_args(args, te::OutputFormat::Pretty).await?;

    assert_snapshot!(stdout.trim_end(), @r"
    Device #0:
    ╭──────────────┬────────────╮
    │ field        │ value      │
    ├──────────────┼────────────┤
    │ address      │ can0:0xf2  │
    │ transport    │ CAN J1939  │
    │ hardware     │ TE_RF_CAN  │
    │ firmware     │ 2.1.7      │
    │ bootloader   │ 1.0.3      │
    │ project      │ <none>     │
    │ project_info │ UNKNOWN -1 │
    ╰──────────────┴────────────╯
    ");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn info_command_reports_missing_index() {
    let result = run_with_argv(["te", "--fake", "--fake-devices", "usb:1-1", "info", "3"]).await;

    let error = result.expect_err("index 3 should not exist");
    assert_eq!(
        "no device at index 3; 1 device(s) discovered",
        error.to_string()
    );
}

#[tokio::test(start_paused = true)]
async fn screen_commands_print_status_and_screen() -> anyhow::Result<()> {
    let set = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1",
        "screen",
        "0",
        "set",
        "4",
    ])
    .await?;
    let get = run_with_argv(["te", "--fake", "--fake-devices", "usb:1-1", "screen", "0", "get"])
        .await?;

    assert_snapshot!(set.trim_end(), @"#0 usb:1-1: success");
    assert_snapshot!(get.trim_end(), @"#0 usb:1-1: screen 0");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn variable_set_accepts_negative_integers() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "can0:0xf2",
        "variable",
        "0",
        "set",
        "--screen-id",
        "6",
        "--variable-id",
        "2",
        "--int",
        "-20",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @"#0 can0:0xf2: success");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn variable_get_of_unknown_variable_fails() {
    let result = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1",
        "variable",
        "0",
        "get",
        "--screen-id",
        "6",
        "--variable-id",
        "2",
    ])
    .await;

    assert!(result.is_err());
}

#[test]
fn brightness_rejects_out_of_range_input() {
    let result = te::Args::try_parse_from([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1",
        "brightness",
        "0",
        "101",
    ]);

    let error = result.expect_err("brightness 101 should fail command parsing");
    assert_eq!(ErrorKind::ValueValidation, error.kind());
}

#[tokio::test(start_paused = true)]
async fn brightness_command_applies_value() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1;can0:0xf2",
        "brightness",
        "1",
        "80",
        "--store",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @"#1 can0:0xf2: success");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_without_index_fans_out_to_target() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1;can0:0xf2;can0:0xf3",
        "restart",
        "--target",
        "can",
    ])
    .await?;

    assert_snapshot!(stdout.trim_end(), @r"
    #1 can0:0xf2: success
    #2 can0:0xf3: success
    ");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restart_fan_out_fails_when_one_device_fails() {
    let result = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1;usb:2-1,deny-auth",
        "restart",
        "--utility",
    ])
    .await;

    let error = result.expect_err("denied authentication should fail the command");
    assert_eq!("1 of 2 device(s) failed", error.to_string());
}

#[tokio::test(start_paused = true)]
async fn fake_discovery_delay_is_applied() -> anyhow::Result<()> {
    let started_at = Instant::now();
    let _ = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1",
        "--fake-discovery-delay",
        "40ms",
        "ls",
    ])
    .await?;

    assert!(started_at.elapsed() >= Duration::from_millis(40));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn update_command_transfers_file() -> anyhow::Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock should be after unix epoch")
        .as_nanos();
    let file_path = std::env::temp_dir().join(format!(
        "te-update-cli-{}-{timestamp}.bin",
        std::process::id()
    ));
    let payload: Vec<u8> = (0..=u8::MAX).cycle().take(300).collect();
    std::fs::write(&file_path, &payload)?;

    let fake = te::FakeArgs::builder()
        .fixture("usb:1-1,drop-ack=56")?
        .build();
    let args = te::Args::new(te::Command::Update(te::UpdateArgs::new(&file_path, Some(0))))
        .with_fake(fake);

    let stdout = run_with_parsed_args(args, te::OutputFormat::Pretty).await?;
    std::fs::remove_file(&file_path)?;

    let crc = format!("{:08x}", crc32fast::hash(&payload));
    assert_eq!(
        format!(
            "#0 usb:1-1: resending chunk at offset 56
#0 usb:1-1: firmware applied
Updated #0 usb:1-1:
╭─────────────────┬──────────╮
│ field           │ value    │
├─────────────────┼──────────┤
│ kind            │ firmware │
│ bytes           │ 300      │
│ chunk_size      │ 56       │
│ crc32           │ {crc} │
│ status          │ SUCCESS  │
│ retransmissions │ 1        │
│ restarted       │ yes      │
╰─────────────────┴──────────╯"
        ),
        stdout.trim_end()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn update_command_rejects_unknown_extension() {
    let result = run_with_argv([
        "te",
        "--fake",
        "--fake-devices",
        "usb:1-1",
        "update",
        "notes.txt",
        "0",
    ])
    .await;

    let error = result.expect_err("unknown extension should fail");
    assert!(error.to_string().contains("notes.txt"));
}
