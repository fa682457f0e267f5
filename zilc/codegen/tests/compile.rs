//! Whole-pipeline tests: compile real sources and check the binary.

use zilc_codegen::{compile, CompileOutput, Options};
use zilc_frontend::preprocess::NoIncludes;
use zilc_zmachine::text::decode;
use zilc_zmachine::ZVersion;

fn build(src: &str, version: Option<ZVersion>) -> CompileOutput {
    let options = Options { version, ..Options::default() };
    let output = compile("test.zil", src, &mut NoIncludes, &options).expect("compiles");
    check_invariants(&output);
    output
}

fn word(image: &[u8], at: usize) -> u16 {
    (u16::from(image[at]) << 8) | u16::from(image[at + 1])
}

/// The laws every produced image obeys: length and checksum headers
/// match the bytes, and static memory ends below high memory.
fn check_invariants(output: &CompileOutput) {
    let image = &output.image;
    let divisor = output.version.length_divisor();
    assert_eq!(u32::from(word(image, 0x1A)) * divisor, image.len() as u32);
    let sum = image[64..]
        .iter()
        .fold(0u16, |a, &b| a.wrapping_add(u16::from(b)));
    assert_eq!(word(image, 0x1C), sum);
    assert!(word(image, 0x0E) < word(image, 0x04), "static below high");
    assert!(image.len() >= 64);
}

#[test]
fn minimal_program() {
    let out = build("<VERSION 3> <ROUTINE GO () <QUIT>>", None);
    let image = &out.image;
    assert_eq!(image[0], 3);
    let pc = word(image, 0x06) as usize;
    // A routine with no locals whose single instruction is quit.
    assert_eq!(image[pc - 1], 0x00);
    assert_eq!(image[pc], 0xBA);
}

#[test]
fn hello_world() {
    let out = build(
        "<VERSION 3> <ROUTINE GO () <TELL \"Hello\" CR> <QUIT>>",
        None,
    );
    let image = &out.image;
    let pc = word(image, 0x06) as usize;
    // print_paddr with a large-constant operand.
    assert_eq!(image[pc], 0x8D);
    let packed = word(image, pc + 1);
    let addr = usize::from(packed) * 2;
    assert!(addr >= word(image, 0x04) as usize, "string in high memory");
    assert_eq!(decode(&image[addr..], ZVersion::V3, None).unwrap(), "Hello");
    // new_line, then quit.
    assert_eq!(image[pc + 3], 0xBB);
    assert_eq!(image[pc + 4], 0xBA);
}

#[test]
fn conditional_branch() {
    let out = build(
        "<GLOBAL X 5> \
         <ROUTINE PRED () <COND (<G? ,X 3> <RTRUE>) (T <RFALSE>)>> \
         <ROUTINE GO () <PRED> <QUIT>>",
        None,
    );
    // jg (long form, variable+small) on global 16 against 3, branch
    // polarity 1 with the return-true offset, falling through to
    // rfalse.
    let expect = [0x43, 16, 3, 0xC1, 0xB1];
    let found = out
        .image
        .windows(expect.len())
        .any(|w| w == expect);
    assert!(found, "expected jg/rtrue/rfalse sequence in the image");
}

#[test]
fn packed_addresses_across_versions() {
    for (version, align) in [(ZVersion::V3, 2), (ZVersion::V5, 4), (ZVersion::V8, 8)] {
        let out = build("<ROUTINE GO () <QUIT>>", Some(version));
        let image = &out.image;
        assert_eq!(image[0], version.number());
        let pc = word(image, 0x06) as usize;
        // The first instruction of GO, just past its locals header.
        assert_eq!(image[pc], 0xBA);
        assert_eq!(image[pc - 1], 0x00);
        // The routine itself sits on the version's alignment boundary.
        assert_eq!((pc - 1) % align, 0);
    }
}

#[test]
fn object_flags_and_properties() {
    let out = build(
        "<OBJECT LAMP (DESC \"lamp\") (FLAGS TAKEBIT LIGHTBIT) (SIZE 15)> \
         <ROUTINE GO () <QUIT>>",
        None,
    );
    let image = &out.image;
    let objects = word(image, 0x0A) as usize;
    // 31 default words, then the single entry.
    let entry = objects + 31 * 2;
    // TAKEBIT and LIGHTBIT are attributes 0 and 1.
    assert_eq!(image[entry], 0xC0);
    assert_eq!(&image[entry + 1..entry + 4], &[0, 0, 0]); // attrs 8..31
    assert_eq!(&image[entry + 4..entry + 7], &[0, 0, 0]); // no family
    let props = word(image, entry + 7) as usize;

    // Short name: length-prefixed encoded "lamp".
    assert_eq!(image[props], 2);
    assert_eq!(decode(&image[props + 1..], ZVersion::V3, None).unwrap(), "lamp");
    // SIZE got the highest free property number (31), data length 2.
    let size_byte = props + 5;
    assert_eq!(image[size_byte], ((2 - 1) << 5) | 31);
    assert_eq!(word(image, size_byte + 1), 15);
    // Terminator.
    assert_eq!(image[size_byte + 3], 0x00);
}

#[test]
fn dictionary_sorts_by_encoding() {
    let out = build(
        "<OBJECT A1 (SYNONYM ZEBRA)> <OBJECT A2 (SYNONYM APPLE)> \
         <OBJECT A3 (SYNONYM MANGO)> <ROUTINE GO () <QUIT>>",
        None,
    );
    let image = &out.image;
    let dict = word(image, 0x08) as usize;
    assert_eq!(image[dict], 3); // separators
    let entry_len = image[dict + 4] as usize;
    assert_eq!(entry_len, 7);
    let count = word(image, dict + 5) as usize;
    assert_eq!(count, 3);
    let entries = dict + 7;
    let mut names = Vec::new();
    for i in 0..count {
        let at = entries + i * entry_len;
        names.push(decode(&image[at..at + 4], ZVersion::V3, None).unwrap());
    }
    assert_eq!(names, vec!["apple", "mango", "zebra"]);
    // Strictly ascending raw bytes.
    for i in 1..count {
        let a = &image[entries + (i - 1) * entry_len..][..4];
        let b = &image[entries + i * entry_len..][..4];
        assert!(a < b);
    }
}

#[test]
fn single_t_clause_is_straight_line() {
    let out = build("<ROUTINE GO () <COND (T <QUIT>)>>", None);
    let image = &out.image;
    let pc = word(image, 0x06) as usize;
    assert_eq!(image[pc], 0xBA);
}

#[test]
fn sixteen_locals_reject() {
    let params: String = (0..16).map(|i| format!("X{i} ")).collect();
    let src = format!("<ROUTINE GO () <QUIT>> <ROUTINE R (\"AUX\" {params}) <RTRUE>> \
                       <ROUTINE C () <R>>");
    let options = Options::default();
    let err = compile("test.zil", &src, &mut NoIncludes, &options).unwrap_err();
    assert!(err.to_string().contains("locals"));
}

#[test]
fn object_limit_per_version() {
    let mut src = String::from("<ROUTINE GO () <QUIT>>");
    for i in 0..=255 {
        src.push_str(&format!("<OBJECT OB-{i} (DESC \"x\")>"));
    }
    // 256 objects exceed V3.
    let err = compile("test.zil", &src, &mut NoIncludes, &Options::default()).unwrap_err();
    assert!(err.to_string().contains("objects"));
    // V5 accepts them.
    let options = Options { version: Some(ZVersion::V5), ..Options::default() };
    let out = compile("test.zil", &src, &mut NoIncludes, &options).expect("V5 allows 256 objects");
    assert_eq!(out.image[0], 5);
}

#[test]
fn globals_strings_and_tables_resolve() {
    let out = build(
        "<GLOBAL GREETING \"hi there\"> \
         <GLOBAL NUMS <TABLE 1 2 3>> \
         <CONSTANT LIMIT 3> \
         <ROUTINE GO () <TELL ,GREETING> <PRINTN <GET ,NUMS ,LIMIT>> <QUIT>>",
        None,
    );
    let image = &out.image;
    // The first global holds a packed string address.
    let globals = word(image, 0x0C) as usize;
    let packed = word(image, globals) as usize;
    assert_eq!(decode(&image[packed * 2..], ZVersion::V3, None).unwrap(), "hi there");
    // The second global holds a table address in dynamic memory.
    let table = word(image, globals + 2) as usize;
    assert!(table < word(image, 0x0E) as usize, "table is writable");
    assert_eq!(word(image, table), 1);
    assert_eq!(word(image, table + 4), 3);
}

#[test]
fn calls_check_arity() {
    let err = compile(
        "test.zil",
        "<ROUTINE TWO (A B) <RTRUE>> <ROUTINE GO () <TWO 1> <QUIT>>",
        &mut NoIncludes,
        &Options::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("argument"));
}

#[test]
fn undefined_atom_is_semantic_error() {
    let err = compile(
        "test.zil",
        "<ROUTINE GO () <PRINTN ,NO-SUCH-THING> <QUIT>>",
        &mut NoIncludes,
        &Options::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("NO-SUCH-THING"));
}

#[test]
fn warnings_are_collected() {
    let out = build(
        "<GLOBAL UNUSED-G 0> <ROUTINE GO () <QUIT>>",
        None,
    );
    assert!(out
        .warnings
        .iter()
        .any(|w| w.message.contains("UNUSED-G")));
}

#[test]
fn syntax_builds_parser_tables() {
    let out = build(
        "<DIRECTIONS NORTH SOUTH> \
         <SYNTAX TAKE OBJECT (FIND TAKEBIT) = V-TAKE> \
         <OBJECT LAMP (SYNONYM LAMP) (FLAGS TAKEBIT)> \
         <GLOBAL PRSA 0> \
         <ROUTINE V-TAKE () <TELL \"Taken.\" CR> <RTRUE>> \
         <ROUTINE GO () <COND (<VERB? TAKE> <V-TAKE>)> <QUIT>>",
        None,
    );
    let image = &out.image;
    // The action table lives at the start of static memory and holds
    // V-TAKE's packed address.
    let static_base = word(image, 0x0E) as usize;
    let packed = word(image, static_base) as usize;
    let addr = packed * 2;
    assert!(addr >= word(image, 0x04) as usize);
    // A routine header: local count <= 15.
    assert!(image[addr] <= 15);
}

#[test]
fn deterministic_output() {
    let src = "<GLOBAL X 1> <OBJECT LAMP (DESC \"lamp\")> <ROUTINE GO () <PRINTN ,X> <QUIT>>";
    let a = build(src, None);
    let b = build(src, None);
    assert_eq!(a.image, b.image);
}

#[test]
fn loops_and_locals() {
    // A counting loop: the generated file must simply assemble with
    // every branch resolving.
    build(
        "<ROUTINE COUNT (N \"AUX\" (I 0)) \
           <REPEAT () \
             <COND (<IGRTR? I .N> <RETURN .I>)> \
             <PRINTN .I>>> \
         <ROUTINE GO () <COUNT 3> <QUIT>>",
        None,
    );
}

#[test]
fn version_gates_opcodes() {
    // COLOR degrades with a warning on V3 but encodes on V5.
    let out = build("<ROUTINE GO () <COLOR 2 9> <QUIT>>", None);
    assert!(out.warnings.iter().any(|w| w.message.contains("COLOR")));
    let out = build("<ROUTINE GO () <COLOR 2 9> <QUIT>>", Some(ZVersion::V5));
    assert!(out.warnings.is_empty());
    // CATCH simply does not exist before V5.
    let err = compile(
        "test.zil",
        "<ROUTINE GO () <CATCH> <QUIT>>",
        &mut NoIncludes,
        &Options::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("CATCH"));
}
