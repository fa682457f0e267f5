//! CLI smoke tests: drive the compile command against real files.

use clap::Parser;

use zilc_cli::commands::CompileCommand;

#[test]
fn compiles_a_file_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("hello.zil");
    std::fs::write(
        &src,
        "<VERSION 3> <ROUTINE GO () <TELL \"Hello from zilc!\" CR> <QUIT>>",
    )
    .unwrap();

    let cmd = CompileCommand::parse_from(["zilc", src.to_str().unwrap()]);
    cmd.execute().unwrap();

    let out = dir.path().join("hello.z3");
    let image = std::fs::read(&out).unwrap();
    assert_eq!(image[0], 3);
    assert!(image.len() >= 64);
    assert_eq!(image.len() % 2, 0);
}

#[test]
fn resolves_includes_next_to_the_source() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("globals.zil"), "<GLOBAL SCORE 0>").unwrap();
    let src = dir.path().join("main.zil");
    std::fs::write(
        &src,
        "<INSERT-FILE \"globals\"> <ROUTINE GO () <PRINTN ,SCORE> <QUIT>>",
    )
    .unwrap();

    let out = dir.path().join("game.z5");
    let cmd = CompileCommand::parse_from([
        "zilc",
        src.to_str().unwrap(),
        "-o",
        out.to_str().unwrap(),
        "-v",
        "xzip",
    ]);
    cmd.execute().unwrap();
    let image = std::fs::read(&out).unwrap();
    assert_eq!(image[0], 5);
}
