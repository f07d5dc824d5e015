fn main() {
    timekeeper_lib::run()
}
