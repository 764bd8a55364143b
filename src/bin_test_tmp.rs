fn main() {
    let src = "program p;
             type r = record
                    case integer of
                      1: (a: integer);
                      1: (b: real);
                  end;
             begin end.";
    let (_, _, errors) = pasc::parser::parse(src);
    println!("num errors: {}", errors.len());
}
